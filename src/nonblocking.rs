//! Async facade over [`Allocator`]
//!
//! Store transactions block, so every call runs on tokio's blocking pool.
//! Enabled by the `async` feature.

use crate::core::{AddressBlock, Allocator, Context, PoolId, Record, Store};
use crate::error::{PoolError, Result};
use std::sync::Arc;
use tokio::task::JoinError;

/// Cheaply cloneable async handle to an [`Allocator`]
#[derive(Debug)]
pub struct AsyncAllocator<S> {
    inner: Arc<Allocator<S>>,
}

impl<S> Clone for AsyncAllocator<S> {
    fn clone(&self) -> Self {
        AsyncAllocator {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Store + 'static> AsyncAllocator<S> {
    pub fn new(allocator: Allocator<S>) -> Self {
        AsyncAllocator {
            inner: Arc::new(allocator),
        }
    }

    /// The wrapped blocking allocator
    pub fn blocking(&self) -> &Allocator<S> {
        &self.inner
    }

    /// See [`Allocator::allocate`]
    pub async fn allocate(
        &self,
        ctx: &Context,
        pool: PoolId,
        prefix_len: u8,
        owner: impl Into<String>,
    ) -> Result<AddressBlock> {
        let owner = owner.into();
        self.run(ctx, move |alloc, ctx| {
            alloc.allocate(&ctx, pool, prefix_len, &owner)
        })
        .await
    }

    /// See [`Allocator::deallocate`]
    pub async fn deallocate(
        &self,
        ctx: &Context,
        pool: PoolId,
        owner: impl Into<String>,
    ) -> Result<AddressBlock> {
        let owner = owner.into();
        self.run(ctx, move |alloc, ctx| alloc.deallocate(&ctx, pool, &owner))
            .await
    }

    /// See [`Allocator::find_allocated`]
    pub async fn find_allocated(
        &self,
        ctx: &Context,
        pool: PoolId,
        owner: impl Into<String>,
    ) -> Result<Option<Record>> {
        let owner = owner.into();
        self.run(ctx, move |alloc, ctx| alloc.find_allocated(&ctx, pool, &owner))
            .await
    }

    /// See [`Allocator::records`]
    pub async fn records(&self, ctx: &Context, pool: PoolId) -> Result<Vec<Record>> {
        self.run(ctx, move |alloc, ctx| alloc.records(&ctx, pool))
            .await
    }

    /// See [`Allocator::seed`]
    pub async fn seed(&self, ctx: &Context, pool: PoolId, block: AddressBlock) -> Result<()> {
        self.run(ctx, move |alloc, ctx| alloc.seed(&ctx, pool, block))
            .await
    }

    async fn run<T, F>(&self, ctx: &Context, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Allocator<S>, Context) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || op(&inner, ctx))
            .await
            .map_err(join_error)?
    }
}

fn join_error(e: JoinError) -> PoolError {
    PoolError::Internal(format!("Allocator task failed: {}", e))
}
