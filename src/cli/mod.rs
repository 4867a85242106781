mod display;
mod repl;

pub use display::Display;
pub use repl::Repl;
