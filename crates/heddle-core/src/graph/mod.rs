//! Task graph model: definitions, mappers and the validated DAG.

pub mod dag;
pub mod definition;
pub mod mapper;

pub use dag::{GraphBuilder, TaskGraph};
pub use definition::{DEFAULT_TIMEOUT, TaskDefinition};
pub use mapper::{InputMapper, MapperContext, OutputMapper};
