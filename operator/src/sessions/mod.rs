pub mod actions;
pub mod children;
pub mod decide;
pub mod monitor;
pub mod reconcile;
