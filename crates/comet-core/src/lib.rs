mod event;
mod model;

pub use event::*;
pub use model::*;
