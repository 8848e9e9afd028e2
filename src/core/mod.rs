pub mod context;
pub mod deadline;
pub mod domain;
pub mod grading;
pub mod normalize;
pub mod protocol;
pub mod runner;
pub mod traits;
