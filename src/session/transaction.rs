use tracing::debug;
use tracing::instrument;
use tracing::warn;

use super::Session;
use crate::error::OrmError;
use crate::error::Result;
use crate::types::FlushMode;

impl Session {
    /// Starts a storage transaction. Only one can be active at a time.
    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub async fn begin(&mut self) -> Result<()> {
        self.check_open()?;
        if self.transaction_active {
            return Err(OrmError::IllegalState("a transaction is already active".into()));
        }
        self.conn.begin().await?;
        self.transaction_active = true;
        self.rollback_only = false;
        Ok(())
    }

    /// Flushes (unless the flush mode is manual), runs before-completion checks and commits. Any failure rolls the
    /// transaction back and is returned.
    pub async fn commit(&mut self) -> Result<()> {
        let result = self.commit_top().await;
        self.funnel(result)
    }

    /// Rolls the transaction back. Pending actions are dropped; the context keeps its instances, which may no
    /// longer match the storage.
    pub async fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        self.require_transaction("rollback")?;
        self.rollback_internal().await
    }

    /// The transaction can only be rolled back from now on.
    pub fn set_rollback_only(&mut self) -> Result<()> {
        self.require_transaction("set_rollback_only")?;
        self.rollback_only = true;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    async fn commit_top(&mut self) -> Result<()> {
        self.check_open()?;
        self.require_transaction("commit")?;
        if self.rollback_only {
            self.rollback_internal().await?;
            return Err(OrmError::RollbackOnly);
        }

        if let Err(err) = self.commit_internal().await {
            debug!("[session {}] commit failed, rolling back: {err}", self.id);
            if let Err(rollback_err) = self.rollback_internal().await {
                warn!("[session {}] rollback after failed commit failed too: {rollback_err}", self.id);
            }
            return Err(err);
        }
        Ok(())
    }

    async fn commit_internal(&mut self) -> Result<()> {
        if self.flush_mode != FlushMode::Manual {
            self.flush_internal().await?;
        }
        let (actions, mut ctx) = self.split();
        actions.completion.before_completion(&mut ctx).await?;
        self.conn.commit().await?;
        debug!("[session {}] committed", self.id);

        self.actions.completion.after_completion(true).await;
        self.finish_transaction(true).await;
        Ok(())
    }

    pub(super) async fn rollback_internal(&mut self) -> Result<()> {
        self.actions.clear();
        self.actions.completion.discard_before();
        let result = self.conn.rollback().await;
        debug!("[session {}] rolled back", self.id);

        self.actions.completion.after_completion(false).await;
        self.finish_transaction(false).await;
        Ok(result?)
    }

    async fn finish_transaction(&mut self, committed: bool) {
        self.transaction_active = false;
        self.rollback_only = false;
        self.context.reset_lock_modes();
        self.interceptor.after_transaction_completion(committed).await;
    }
}
