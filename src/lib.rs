pub mod error;
pub mod ident;
pub mod schema;
pub mod graph;
pub mod provider;
pub mod resolver;
pub mod demux;
pub mod pipeline;
pub mod process;

pub use error::{Result, SortError};
pub use ident::IdBlock;
pub use process::{inspect_file, sort_file, Report, SortOptions, Summary};
pub use resolver::{resolve, Resolution};
