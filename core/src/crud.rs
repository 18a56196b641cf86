// RestKit
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Capabilities that a persistence layer can offer to a RESTful resource.
//!
//! Resources do not know how entities are stored.  They receive implementations of the traits in
//! this module and expose one HTTP operation per implemented trait.  Any operation whose trait is
//! not implemented is reported as not allowed to the caller.
//!
//! Implementations advertise what they support via `CrudCapabilities`, whose methods all default
//! to "not supported".  A repository that implements, say, `Creator` and `ByIdFinder` overrides
//! `creator` and `by_id_finder` to return itself.

use crate::context::Context;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Persistence errors.  These are the errors that capabilities report back to the resource.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CrudError {
    /// Indicates that a request to create an entity failed because it already exists.
    #[error("{0}")]
    AlreadyExists(String),

    /// Catch-all error type for unexpected backend errors.
    #[error("{0}")]
    BackendError(String),

    /// Indicates that the caller is not allowed to perform the operation.
    #[error("{0}")]
    Forbidden(String),

    /// Indicates an error in the input data.
    #[error("{0}")]
    InvalidInput(String),

    /// Indicates that a requested entity does not exist.
    #[error("{0}")]
    NotFound(String),
}

/// Result type for this module.
pub type CrudResult<T> = Result<T, CrudError>;

/// Stream of entities returned by `AllFinder::find_all`.
///
/// Dropping the stream releases whatever resources back it.
pub type EntityStream<E> = BoxStream<'static, CrudResult<E>>;

/// Capability to persist new entities.
#[async_trait]
pub trait Creator<E: Send + 'static>: Send + Sync {
    /// Stores `entity` and returns it with any fields assigned by the backend, such as its ID.
    async fn create(&self, ctx: &Context, entity: E) -> CrudResult<E>;
}

/// Capability to enumerate all entities.
pub trait AllFinder<E: Send + 'static>: Send + Sync {
    /// Returns a lazy stream over all entities in insertion order.
    fn find_all(&self, ctx: &Context) -> EntityStream<E>;
}

/// Capability to look up one entity by its identifier.
#[async_trait]
pub trait ByIdFinder<E: Send + 'static, I: Send + Sync + 'static>: Send + Sync {
    /// Returns the entity identified by `id`, or `None` if it does not exist.
    async fn find_by_id(&self, ctx: &Context, id: &I) -> CrudResult<Option<E>>;
}

/// Capability to replace existing entities.
#[async_trait]
pub trait Updater<E: Send + 'static>: Send + Sync {
    /// Replaces the stored entity that has the same identifier as `entity`.
    ///
    /// Returns `CrudError::NotFound` if there is no such entity.
    async fn update(&self, ctx: &Context, entity: E) -> CrudResult<()>;
}

/// Capability to delete one entity by its identifier.
#[async_trait]
pub trait ByIdDeleter<I: Send + Sync + 'static>: Send + Sync {
    /// Deletes the entity identified by `id`.
    ///
    /// Returns `CrudError::NotFound` if there is no such entity.
    async fn delete_by_id(&self, ctx: &Context, id: &I) -> CrudResult<()>;
}

/// Capability to delete all entities.
#[async_trait]
pub trait AllDeleter: Send + Sync {
    /// Deletes all entities.
    async fn delete_all(&self, ctx: &Context) -> CrudResult<()>;
}

/// Advertises which CRUD capabilities a repository implements.
pub trait CrudCapabilities<E, I>: Send + Sync + 'static
where
    E: Send + 'static,
    I: Send + Sync + 'static,
{
    /// Returns the `Creator` view of this repository, if supported.
    fn creator(self: Arc<Self>) -> Option<Arc<dyn Creator<E>>> {
        None
    }

    /// Returns the `AllFinder` view of this repository, if supported.
    fn all_finder(self: Arc<Self>) -> Option<Arc<dyn AllFinder<E>>> {
        None
    }

    /// Returns the `ByIdFinder` view of this repository, if supported.
    fn by_id_finder(self: Arc<Self>) -> Option<Arc<dyn ByIdFinder<E, I>>> {
        None
    }

    /// Returns the `Updater` view of this repository, if supported.
    fn updater(self: Arc<Self>) -> Option<Arc<dyn Updater<E>>> {
        None
    }

    /// Returns the `ByIdDeleter` view of this repository, if supported.
    fn by_id_deleter(self: Arc<Self>) -> Option<Arc<dyn ByIdDeleter<I>>> {
        None
    }

    /// Returns the `AllDeleter` view of this repository, if supported.
    fn all_deleter(self: Arc<Self>) -> Option<Arc<dyn AllDeleter>> {
        None
    }
}

/// Test utilities.
#[cfg(any(test, feature = "testutils"))]
pub mod testutils {
    use super::*;
    use futures::lock::Mutex;
    use futures::stream::{self, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Entities that can be stored in a `MemoryRepository`.
    pub trait Identifiable<I> {
        /// Returns the identifier of the entity, if it has one.
        fn id(&self) -> Option<I>;

        /// Sets the identifier of the entity.
        fn set_id(&mut self, id: I);
    }

    /// Decrements the counter of open streams when dropped.
    struct OpenStreamGuard(Arc<AtomicUsize>);

    impl Drop for OpenStreamGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Error to return from `find_all` once a given number of entities have been yielded.
    struct InjectedError {
        /// Number of entities to yield before failing.
        after: usize,

        /// The error to yield.
        error: CrudError,
    }

    /// In-memory repository that implements all CRUD capabilities.
    pub struct MemoryRepository<E, I> {
        /// Stored entities in insertion order.
        entities: Mutex<Vec<E>>,

        /// Generator for the identifiers of new entities, fed with a sequence number.
        next_id: Box<dyn Fn(usize) -> I + Send + Sync>,

        /// Sequence number for the next identifier.
        sequence: AtomicUsize,

        /// Number of `find_all` streams that have not been dropped yet.
        open_streams: Arc<AtomicUsize>,

        /// Error to inject into `find_all`, if any.
        find_all_error: Mutex<Option<InjectedError>>,
    }

    impl<E, I> MemoryRepository<E, I>
    where
        E: Identifiable<I> + Clone + Send + Sync + 'static,
        I: Clone + PartialEq + Send + Sync + 'static,
    {
        /// Creates an empty repository that assigns identifiers with `next_id`.
        pub fn new<F: Fn(usize) -> I + Send + Sync + 'static>(next_id: F) -> Self {
            Self {
                entities: Mutex::default(),
                next_id: Box::new(next_id),
                sequence: AtomicUsize::new(1),
                open_streams: Arc::default(),
                find_all_error: Mutex::default(),
            }
        }

        /// Returns a copy of all stored entities.
        pub async fn all(&self) -> Vec<E> {
            self.entities.lock().await.clone()
        }

        /// Returns the number of streams returned by `find_all` that are still alive.
        pub fn open_streams(&self) -> usize {
            self.open_streams.load(Ordering::SeqCst)
        }

        /// Makes `find_all` yield `error` after yielding `after` entities.
        pub async fn inject_find_all_error(&self, after: usize, error: CrudError) {
            *self.find_all_error.lock().await = Some(InjectedError { after, error });
        }
    }

    #[async_trait]
    impl<E, I> Creator<E> for MemoryRepository<E, I>
    where
        E: Identifiable<I> + Clone + Send + Sync + 'static,
        I: Clone + PartialEq + Send + Sync + 'static,
    {
        async fn create(&self, _ctx: &Context, mut entity: E) -> CrudResult<E> {
            let mut entities = self.entities.lock().await;
            match entity.id() {
                Some(id) => {
                    if entities.iter().any(|e| e.id().as_ref() == Some(&id)) {
                        return Err(CrudError::AlreadyExists("Entity already exists".to_owned()));
                    }
                }
                None => {
                    let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
                    entity.set_id((self.next_id)(sequence));
                }
            }
            entities.push(entity.clone());
            Ok(entity)
        }
    }

    impl<E, I> AllFinder<E> for MemoryRepository<E, I>
    where
        E: Identifiable<I> + Clone + Send + Sync + 'static,
        I: Clone + PartialEq + Send + Sync + 'static,
    {
        fn find_all(&self, _ctx: &Context) -> EntityStream<E> {
            // The lock is only contended by tests that mutate the repository concurrently with
            // the stream creation, which none do.
            let entities = self.entities.try_lock().map(|e| (*e).clone()).unwrap_or_default();
            let mut items: Vec<CrudResult<E>> = entities.into_iter().map(Ok).collect();
            if let Some(injected) = self.find_all_error.try_lock().and_then(|mut e| e.take()) {
                items.truncate(injected.after);
                items.push(Err(injected.error));
            }

            self.open_streams.fetch_add(1, Ordering::SeqCst);
            let guard = OpenStreamGuard(self.open_streams.clone());
            stream::iter(items)
                .map(move |item| {
                    let _guard = &guard;
                    item
                })
                .boxed()
        }
    }

    #[async_trait]
    impl<E, I> ByIdFinder<E, I> for MemoryRepository<E, I>
    where
        E: Identifiable<I> + Clone + Send + Sync + 'static,
        I: Clone + PartialEq + Send + Sync + 'static,
    {
        async fn find_by_id(&self, _ctx: &Context, id: &I) -> CrudResult<Option<E>> {
            let entities = self.entities.lock().await;
            Ok(entities.iter().find(|e| e.id().as_ref() == Some(id)).cloned())
        }
    }

    #[async_trait]
    impl<E, I> Updater<E> for MemoryRepository<E, I>
    where
        E: Identifiable<I> + Clone + Send + Sync + 'static,
        I: Clone + PartialEq + Send + Sync + 'static,
    {
        async fn update(&self, _ctx: &Context, entity: E) -> CrudResult<()> {
            let mut entities = self.entities.lock().await;
            let id = entity.id();
            match entities.iter_mut().find(|e| e.id().is_some() && e.id() == id) {
                Some(slot) => {
                    *slot = entity;
                    Ok(())
                }
                None => Err(CrudError::NotFound("Entity not found".to_owned())),
            }
        }
    }

    #[async_trait]
    impl<E, I> ByIdDeleter<I> for MemoryRepository<E, I>
    where
        E: Identifiable<I> + Clone + Send + Sync + 'static,
        I: Clone + PartialEq + Send + Sync + 'static,
    {
        async fn delete_by_id(&self, _ctx: &Context, id: &I) -> CrudResult<()> {
            let mut entities = self.entities.lock().await;
            let before = entities.len();
            entities.retain(|e| e.id().as_ref() != Some(id));
            if entities.len() == before {
                return Err(CrudError::NotFound("Entity not found".to_owned()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl<E, I> AllDeleter for MemoryRepository<E, I>
    where
        E: Identifiable<I> + Clone + Send + Sync + 'static,
        I: Clone + PartialEq + Send + Sync + 'static,
    {
        async fn delete_all(&self, _ctx: &Context) -> CrudResult<()> {
            self.entities.lock().await.clear();
            Ok(())
        }
    }

    impl<E, I> CrudCapabilities<E, I> for MemoryRepository<E, I>
    where
        E: Identifiable<I> + Clone + Send + Sync + 'static,
        I: Clone + PartialEq + Send + Sync + 'static,
    {
        fn creator(self: Arc<Self>) -> Option<Arc<dyn Creator<E>>> {
            Some(self)
        }

        fn all_finder(self: Arc<Self>) -> Option<Arc<dyn AllFinder<E>>> {
            Some(self)
        }

        fn by_id_finder(self: Arc<Self>) -> Option<Arc<dyn ByIdFinder<E, I>>> {
            Some(self)
        }

        fn updater(self: Arc<Self>) -> Option<Arc<dyn Updater<E>>> {
            Some(self)
        }

        fn by_id_deleter(self: Arc<Self>) -> Option<Arc<dyn ByIdDeleter<I>>> {
            Some(self)
        }

        fn all_deleter(self: Arc<Self>) -> Option<Arc<dyn AllDeleter>> {
            Some(self)
        }
    }
}
