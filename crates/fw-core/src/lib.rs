pub mod admission;
pub mod loader;
pub mod model;
pub mod validator;
pub mod value;

pub use admission::*;
pub use loader::*;
pub use model::*;
pub use validator::*;
pub use value::*;
