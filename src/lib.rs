pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod index;
pub mod matting;
pub mod meta;
pub mod playlist;
pub mod scan;
pub mod slideshow;
pub mod store;
pub mod tags;
pub mod web;
pub mod tasks {
    pub mod files;
    pub mod manager;
    pub mod mqtt;
    pub mod viewer;
}

pub use error::{Error, Result};
