//! Process-wide transaction manager used by `#[transactional]` functions and by
//! code that has no manager handle of its own.

use std::rc::Rc;
use std::sync::Arc;

use parking_lot::RwLock;

use tracing::debug;

use crate::transactions::{
    ThreadLocalTransactionManager, TransactionDefinition, TransactionManager, TransactionTemplate,
};
use crate::{ConnectionProvider, StatefulTransaction, TxError, TxResult};

/// A manager that may be shared by every thread of the process.
pub type SharedTransactionManager = Arc<dyn TransactionManager + Send + Sync>;

static ACTIVE: RwLock<Option<SharedTransactionManager>> = parking_lot::const_rwlock(None);

/// Install `manager` as the process-wide manager, returning the one it replaces.
pub fn install(manager: SharedTransactionManager) -> Option<SharedTransactionManager> {
    debug!("installing process-wide transaction manager");
    ACTIVE.write().replace(manager)
}

/// Install a [`ThreadLocalTransactionManager`] over `provider`.
pub fn install_default<P>(provider: P) -> Option<SharedTransactionManager>
where
    P: ConnectionProvider + 'static,
{
    install(Arc::new(ThreadLocalTransactionManager::new(Arc::new(
        provider,
    ))))
}

pub fn uninstall() -> Option<SharedTransactionManager> {
    ACTIVE.write().take()
}

/// The installed manager, or [`TxError::NotConfigured`].
pub fn manager() -> TxResult<SharedTransactionManager> {
    ACTIVE.read().clone().ok_or(TxError::NotConfigured)
}

/// The live transaction bound to the calling thread by the installed manager,
/// opened and bound on first use.
pub fn transaction() -> TxResult<Rc<StatefulTransaction>> {
    manager()?.get_transaction()
}

/// Run `f` under `def` with the installed manager, see [`TransactionTemplate::execute_with`].
pub fn execute<R, E, F>(def: &TransactionDefinition, f: F) -> Result<R, E>
where
    F: FnOnce(&StatefulTransaction) -> Result<R, E>,
    E: From<TxError>,
{
    let manager = manager()?;
    TransactionTemplate::new(manager).execute_with(def, f)
}
