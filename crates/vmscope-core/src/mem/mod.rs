//! Component A: the Memory Window.

mod window;

pub use window::MemoryWindow;
