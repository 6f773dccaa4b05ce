//! Resource store for the Lolcow controller
//!
//! Typed access to the Kubernetes objects the controller reads and writes:
//! the `Lolcow` desired-state objects and the Deployments/Services managed on
//! their behalf.
//!
//! # Example
//!
//! ```no_run
//! use resource_store::{KubeStore, ObjectKey, ResourceKind, ResourceStoreTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let store = KubeStore::new(client);
//!
//! let key = ObjectKey::new("default", "my-cow");
//! match store.get(ResourceKind::Workload, &key).await {
//!     Ok(obj) => println!("found {:?}", obj.resource_version()),
//!     Err(e) if e.is_not_found() => println!("not created yet"),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeStore;
pub use error::StoreError;
pub use models::*;
pub use store_trait::ResourceStoreTrait;
#[cfg(feature = "test-util")]
pub use mock::{MockFailure, MockOp, MockResourceStore, WriteRecord};
