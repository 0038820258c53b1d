//! Single-writer lock arbitration.
//!
//! Every engine instance claims the store by writing a random token into
//! the lock collection. Each later transaction re-reads the token; if it no
//! longer matches, another instance has taken over and this one is dead for
//! good. Lost is terminal: the displaced instance must never write again,
//! because the new owner may have changed anything since.
//!
//! The check-and-claim sequence is safe across processes because a commit
//! that races a concurrent acquirer fails the journal conflict check and
//! surfaces the same lost-lock error.

use tracing::warn;

use crate::error::{Result, StoreError};
use crate::store::{Collection, Key, Transaction, Value};

use super::random_id;

/// The lock collection holds exactly one record.
const LOCK_KEY: Key = Key::Index(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unacquired,
    Held,
    Lost,
}

pub struct LockArbiter {
    token: String,
    state: LockState,
}

impl LockArbiter {
    pub fn new() -> Self {
        Self {
            token: random_id(),
            state: LockState::Unacquired,
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    /// Claims the lock by writing this instance's token. Displaces any
    /// previous holder; their next check fails.
    pub fn acquire(&mut self, tx: &mut Transaction<'_>) -> Result<()> {
        if self.state == LockState::Lost {
            return Err(StoreError::LockLost);
        }
        tx.put(Collection::Lock, LOCK_KEY, Value::text(self.token.clone()))?;
        self.state = LockState::Held;
        Ok(())
    }

    /// Verifies the stored token still belongs to this instance. Run at the
    /// start of every transaction; a mismatch is terminal.
    pub fn check(&mut self, tx: &Transaction<'_>) -> Result<()> {
        match self.state {
            LockState::Lost => return Err(StoreError::LockLost),
            LockState::Unacquired => {
                return Err(StoreError::corrupt("lock checked before acquisition"))
            }
            LockState::Held => {}
        }

        let stored = tx.get(Collection::Lock, &LOCK_KEY)?;
        let held = matches!(&stored, Some(Value::Text(token)) if *token == self.token);
        if held {
            Ok(())
        } else {
            warn!("write lock taken over by another instance");
            self.state = LockState::Lost;
            Err(StoreError::LockLost)
        }
    }
}

impl Default for LockArbiter {
    fn default() -> Self {
        Self::new()
    }
}
