pub mod analysis;
pub mod config_manager;
pub mod error;
pub mod image;
pub mod questionnaire;
pub mod store;

pub use analysis::*;
pub use config_manager::*;
pub use error::*;
pub use image::*;
pub use questionnaire::*;
pub use store::*;
