//! Per-taxpayer sequential numbering.
//!
//! The next number is derived from the highest stored `secuencial`, so the
//! read and the insert that consumes it must not interleave with another
//! issuance for the same company. [`Sequencer::reserve`] hands out a
//! [`SequentialReservation`] holding that company's lock until it is dropped.
use crate::store::{DocumentStore, StoreError};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

pub const SEQUENTIAL_WIDTH: usize = 9;
pub const MAX_SEQUENTIAL: u32 = 999_999_999;

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("sequential range exhausted for company {company_id}")]
    Exhausted { company_id: String },
    #[error("stored sequential '{value}' for company {company_id} is not numeric")]
    Corrupt { company_id: String, value: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Issues zero-padded 9-digit sequentials per company.
#[derive(Debug, Default)]
pub struct Sequencer {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// A reserved sequential. The company stays locked until this is dropped,
/// which callers do once the invoice using it has been persisted.
#[derive(Debug)]
pub struct SequentialReservation {
    company_id: String,
    value: String,
    _guard: OwnedMutexGuard<()>,
}

impl SequentialReservation {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn company_id(&self) -> &str {
        &self.company_id
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, company_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(company_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Lock the company and compute its next sequential.
    pub async fn reserve(
        &self,
        store: &dyn DocumentStore,
        company_id: &str,
    ) -> Result<SequentialReservation, SequenceError> {
        let guard = self.lock_for(company_id).lock_owned().await;
        let value = next_from_store(store, company_id).await?;
        debug!(company_id, secuencial = %value, "sequential reserved");
        Ok(SequentialReservation {
            company_id: company_id.to_string(),
            value,
            _guard: guard,
        })
    }

    /// Next sequential without reserving it.
    pub async fn peek_next(
        &self,
        store: &dyn DocumentStore,
        company_id: &str,
    ) -> Result<String, SequenceError> {
        next_from_store(store, company_id).await
    }
}

async fn next_from_store(
    store: &dyn DocumentStore,
    company_id: &str,
) -> Result<String, SequenceError> {
    let current = store.max_sequential(company_id).await?;
    next_sequential(company_id, current.as_deref())
}

/// Successor of `current`, zero-padded to nine digits. `None` yields
/// `000000001`.
///
/// # Examples
/// ```rust
/// use factura_core::sequencer::next_sequential;
///
/// assert_eq!(next_sequential("c1", None)?, "000000001");
/// assert_eq!(next_sequential("c1", Some("000000041"))?, "000000042");
/// # Ok::<(), factura_core::sequencer::SequenceError>(())
/// ```
pub fn next_sequential(company_id: &str, current: Option<&str>) -> Result<String, SequenceError> {
    let current = match current {
        None => 0,
        Some(value) => value
            .trim()
            .parse::<u32>()
            .map_err(|_| SequenceError::Corrupt {
                company_id: company_id.to_string(),
                value: value.to_string(),
            })?,
    };
    if current >= MAX_SEQUENTIAL {
        return Err(SequenceError::Exhausted {
            company_id: company_id.to_string(),
        });
    }
    Ok(format!("{:0width$}", current + 1, width = SEQUENTIAL_WIDTH))
}
