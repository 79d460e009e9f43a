pub mod errors;
pub mod factory;
pub mod local;

pub use factory::AppFactory;
pub use local::AppLocal;
