pub mod bootstrap;
pub mod errors;
pub mod factory;
pub mod registry;
pub mod search;
pub mod service;
pub mod writer;

pub use factory::AppFactory;
pub use service::AppService;
