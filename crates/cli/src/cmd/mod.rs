pub mod check;
pub mod gate;
pub mod generate;
pub mod run;
pub mod summary;
