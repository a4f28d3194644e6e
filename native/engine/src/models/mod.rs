mod app;
pub use app::*;
mod category;
pub use category::*;
mod manifest;
pub use manifest::*;
