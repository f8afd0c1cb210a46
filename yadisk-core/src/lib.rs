mod client;

pub use client::{DirectoryPage, Resource, ResourceType, YadiskClient, YadiskError};
