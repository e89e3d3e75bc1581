pub mod check;
pub mod ctl;
pub mod sim;
