pub mod fetch;
pub mod report;
pub mod run;
pub mod shim;
