/// Remote module runs programs on a compile-and-run HTTP service.
pub mod api;
pub mod backend;
pub mod warnings;
