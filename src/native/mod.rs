/// Native module contains the backends that run on this machine,
/// driving an external interpreter or a toolchain plugin as child processes.
pub mod interpreter;
pub mod python;
pub mod toolchain;
