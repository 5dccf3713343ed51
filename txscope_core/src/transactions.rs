//! Context-bound transaction management modeled after Spring's TransactionTemplate.
//!
//! A [`TransactionManager`] keeps at most one current [`StatefulTransaction`] per
//! execution context and hands it to every caller in that context.
//! [`TransactionManagerExt::execute_in_context`] demarcates an explicit boundary:
//! it binds a transaction for the duration of a block, commits or rolls it back,
//! closes it, and restores whatever was bound before.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::{ConnectionProvider, StatefulTransaction, TxError, TxResult};

/// Transaction propagation behavior. Transactions are flat: there are no
/// savepoints, so a new transaction always runs on its own connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Join the live transaction bound to the context, or demarcate a new one.
    Required,
    /// Always demarcate a new transaction; the current binding is suspended.
    RequiresNew,
    /// Join the live transaction bound to the context, failing if there is none.
    Mandatory,
}

/// Transaction isolation level (best-effort across backends).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    Default,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Transaction definition describing desired semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDefinition {
    pub propagation: Propagation,
    pub isolation: Isolation,
    pub read_only: bool,
    pub timeout: Option<Duration>,
}

impl Default for TransactionDefinition {
    fn default() -> Self {
        Self {
            propagation: Propagation::Required,
            isolation: Isolation::Default,
            read_only: false,
            timeout: None,
        }
    }
}

/// Access to "the" transaction of the calling execution context.
///
/// Implementations provide the slot (`current_transaction` / `set_transaction`)
/// and the factory (`open_transaction_with`); lookup and lazy opening are shared.
pub trait TransactionManager {
    /// Raw read of the context slot. The transaction may no longer be live.
    fn current_transaction(&self) -> Option<Rc<StatefulTransaction>>;

    /// Unconditionally replace the context binding; `None` clears it.
    fn set_transaction(&self, tx: Option<Rc<StatefulTransaction>>);

    /// Open a new transaction on a fresh connection without binding it.
    fn open_transaction_with(&self, def: &TransactionDefinition)
        -> TxResult<Rc<StatefulTransaction>>;

    fn open_transaction(&self) -> TxResult<Rc<StatefulTransaction>> {
        self.open_transaction_with(&TransactionDefinition::default())
    }

    fn has_live_transaction(&self) -> bool {
        self.current_transaction().is_some_and(|tx| tx.is_live())
    }

    /// The live transaction bound to this context, opening and binding one first
    /// if there is none.
    fn get_transaction(&self) -> TxResult<Rc<StatefulTransaction>> {
        if let Some(tx) = self.current_transaction().filter(|tx| tx.is_live()) {
            return Ok(tx);
        }
        let tx = self.open_transaction()?;
        self.set_transaction(Some(Rc::clone(&tx)));
        Ok(tx)
    }
}

impl<M: TransactionManager + ?Sized> TransactionManager for &M {
    fn current_transaction(&self) -> Option<Rc<StatefulTransaction>> {
        (**self).current_transaction()
    }
    fn set_transaction(&self, tx: Option<Rc<StatefulTransaction>>) {
        (**self).set_transaction(tx)
    }
    fn open_transaction_with(
        &self,
        def: &TransactionDefinition,
    ) -> TxResult<Rc<StatefulTransaction>> {
        (**self).open_transaction_with(def)
    }
    fn open_transaction(&self) -> TxResult<Rc<StatefulTransaction>> {
        (**self).open_transaction()
    }
    fn has_live_transaction(&self) -> bool {
        (**self).has_live_transaction()
    }
    fn get_transaction(&self) -> TxResult<Rc<StatefulTransaction>> {
        (**self).get_transaction()
    }
}

impl<M: TransactionManager + ?Sized> TransactionManager for Arc<M> {
    fn current_transaction(&self) -> Option<Rc<StatefulTransaction>> {
        (**self).current_transaction()
    }
    fn set_transaction(&self, tx: Option<Rc<StatefulTransaction>>) {
        (**self).set_transaction(tx)
    }
    fn open_transaction_with(
        &self,
        def: &TransactionDefinition,
    ) -> TxResult<Rc<StatefulTransaction>> {
        (**self).open_transaction_with(def)
    }
    fn open_transaction(&self) -> TxResult<Rc<StatefulTransaction>> {
        (**self).open_transaction()
    }
    fn has_live_transaction(&self) -> bool {
        (**self).has_live_transaction()
    }
    fn get_transaction(&self) -> TxResult<Rc<StatefulTransaction>> {
        (**self).get_transaction()
    }
}

/// Scoped execution on top of any [`TransactionManager`].
pub trait TransactionManagerExt: TransactionManager {
    /// Run `block` with `tx` as the context's current transaction.
    ///
    /// On success `tx` is committed, on failure it is rolled back and the
    /// block's own error is returned unchanged. Either way `tx` is closed and
    /// the previously bound live transaction (or none) is restored, also when
    /// the block panics. Nested calls therefore leave the outer binding intact.
    ///
    /// A failed commit is rolled back and returned; rollback and close failures
    /// that occur while another failure is already being returned are logged.
    fn execute_in_context<R, E, F>(&self, tx: Rc<StatefulTransaction>, block: F) -> Result<R, E>
    where
        F: FnOnce() -> Result<R, E>,
        E: From<TxError>,
    {
        let previous = self.current_transaction().filter(|prev| prev.is_live());
        self.set_transaction(Some(Rc::clone(&tx)));
        let mut scope = ContextScope {
            manager: self,
            tx,
            previous,
            completed: false,
        };
        let outcome = block();
        scope.complete(outcome)
    }
}

impl<M: TransactionManager + ?Sized> TransactionManagerExt for M {}

/// Owns the binding made by `execute_in_context`. Dropping it restores the
/// previous binding; dropping it before `complete` (unwinding) also rolls back
/// and closes the transaction.
struct ContextScope<'a, M: TransactionManager + ?Sized> {
    manager: &'a M,
    tx: Rc<StatefulTransaction>,
    previous: Option<Rc<StatefulTransaction>>,
    completed: bool,
}

impl<M: TransactionManager + ?Sized> ContextScope<'_, M> {
    fn complete<R, E: From<TxError>>(&mut self, outcome: Result<R, E>) -> Result<R, E> {
        let tx = &self.tx;
        let outcome = match outcome {
            Ok(value) if tx.is_live() => {
                debug!(tx = tx.id(), "committing transaction");
                match tx.commit() {
                    Ok(()) => Ok(value),
                    Err(commit_err) => {
                        error!(tx = tx.id(), error = %commit_err, "commit failed, rolling back");
                        rollback_quietly(tx);
                        Err(E::from(commit_err))
                    }
                }
            }
            Ok(value) => Ok(value),
            Err(err) => {
                rollback_quietly(tx);
                Err(err)
            }
        };

        let closed = if tx.is_live() {
            debug!(tx = tx.id(), "closing transaction");
            tx.close()
        } else {
            Ok(())
        };
        self.completed = true;

        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close_err)) => Err(E::from(close_err)),
            (Err(err), Err(close_err)) => {
                error!(tx = tx.id(), error = %close_err, "close failed while propagating an earlier failure");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
        }
    }
}

fn rollback_quietly(tx: &StatefulTransaction) {
    if !tx.is_live() {
        return;
    }
    debug!(tx = tx.id(), "rolling back transaction");
    if let Err(rollback_err) = tx.rollback() {
        error!(tx = tx.id(), error = %rollback_err, "rollback failed; the original failure is propagated");
    }
}

impl<M: TransactionManager + ?Sized> Drop for ContextScope<'_, M> {
    fn drop(&mut self) {
        if !self.completed {
            warn!(tx = self.tx.id(), "scope left without completing, rolling back");
            rollback_quietly(&self.tx);
            if self.tx.is_live() {
                if let Err(close_err) = self.tx.close() {
                    error!(tx = self.tx.id(), error = %close_err, "close failed during unwinding");
                }
            }
        }
        self.manager.set_transaction(self.previous.take());
    }
}

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity shared by a manager and its clones. Dropping the last handle
/// releases the binding on the dropping thread; bindings left on other threads
/// are swept the next time that thread touches any thread-local manager.
#[derive(Debug)]
struct SlotKey {
    id: u64,
}

impl Drop for SlotKey {
    fn drop(&mut self) {
        let released = SLOTS
            .try_with(|slots| {
                slots
                    .try_borrow_mut()
                    .ok()
                    .and_then(|mut slots| slots.remove(&self.id))
            })
            .ok()
            .flatten();
        drop(released);
    }
}

struct Binding {
    owner: Weak<SlotKey>,
    tx: Rc<StatefulTransaction>,
}

// Per-thread slots of every ThreadLocalTransactionManager, keyed by manager id.
thread_local! {
    static SLOTS: RefCell<HashMap<u64, Binding>> = RefCell::new(HashMap::new());
}

// Runs `f` on this thread's slots after evicting bindings of dropped managers.
// Evicted and returned bindings are dropped by the caller, outside the borrow,
// since releasing the last handle closes a connection.
fn with_slots<R>(f: impl FnOnce(&mut HashMap<u64, Binding>) -> R) -> R {
    let (out, orphaned) = SLOTS.with(|slots| {
        let mut slots = slots.borrow_mut();
        let dead: Vec<u64> = slots
            .iter()
            .filter(|(_, binding)| binding.owner.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        let orphaned: Vec<Binding> = dead.iter().filter_map(|id| slots.remove(id)).collect();
        (f(&mut slots), orphaned)
    });
    if !orphaned.is_empty() {
        debug!(count = orphaned.len(), "releasing bindings of dropped managers");
    }
    drop(orphaned);
    out
}

/// The default manager: every thread gets its own, isolated slot.
///
/// The manager itself is `Send + Sync` and can be shared freely (for example
/// installed process-wide through [`crate::config`]); the transactions it
/// hands out stay on the thread that opened them. Clones share the same slots.
#[derive(Clone)]
pub struct ThreadLocalTransactionManager {
    key: Arc<SlotKey>,
    provider: Arc<dyn ConnectionProvider>,
    defaults: TransactionDefinition,
    auto_close: bool,
}

impl ThreadLocalTransactionManager {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            key: Arc::new(SlotKey {
                id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            }),
            provider,
            defaults: TransactionDefinition::default(),
            auto_close: false,
        }
    }

    /// Definition used by `open_transaction` (and thus lazy opening).
    pub fn with_defaults(mut self, def: TransactionDefinition) -> Self {
        self.defaults = def;
        self
    }

    /// Auto-close policy applied to every transaction this manager opens.
    pub fn with_auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }
}

impl fmt::Debug for ThreadLocalTransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalTransactionManager")
            .field("id", &self.key.id)
            .field("defaults", &self.defaults)
            .field("auto_close", &self.auto_close)
            .finish_non_exhaustive()
    }
}

impl TransactionManager for ThreadLocalTransactionManager {
    fn current_transaction(&self) -> Option<Rc<StatefulTransaction>> {
        with_slots(|slots| slots.get(&self.key.id).map(|b| Rc::clone(&b.tx)))
    }

    fn set_transaction(&self, tx: Option<Rc<StatefulTransaction>>) {
        let replaced = with_slots(|slots| match tx {
            Some(tx) => slots.insert(
                self.key.id,
                Binding {
                    owner: Arc::downgrade(&self.key),
                    tx,
                },
            ),
            None => slots.remove(&self.key.id),
        });
        drop(replaced);
    }

    fn open_transaction_with(
        &self,
        def: &TransactionDefinition,
    ) -> TxResult<Rc<StatefulTransaction>> {
        let tx = StatefulTransaction::open(self.provider.as_ref(), def)?
            .with_auto_close(self.auto_close);
        debug!(tx = tx.id(), manager = self.key.id, "opened transaction");
        Ok(Rc::new(tx))
    }

    fn open_transaction(&self) -> TxResult<Rc<StatefulTransaction>> {
        self.open_transaction_with(&self.defaults)
    }
}

/// A manager that is itself the execution context: it owns a single slot and
/// is meant to be passed explicitly to the code that works inside it.
pub struct LocalTransactionManager {
    provider: Arc<dyn ConnectionProvider>,
    slot: RefCell<Option<Rc<StatefulTransaction>>>,
}

impl LocalTransactionManager {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            slot: RefCell::new(None),
        }
    }
}

impl fmt::Debug for LocalTransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransactionManager")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl TransactionManager for LocalTransactionManager {
    fn current_transaction(&self) -> Option<Rc<StatefulTransaction>> {
        self.slot.borrow().clone()
    }

    fn set_transaction(&self, tx: Option<Rc<StatefulTransaction>>) {
        let replaced = self.slot.replace(tx);
        drop(replaced);
    }

    fn open_transaction_with(
        &self,
        def: &TransactionDefinition,
    ) -> TxResult<Rc<StatefulTransaction>> {
        Ok(Rc::new(StatefulTransaction::open(self.provider.as_ref(), def)?))
    }
}

/// Convenience wrapper similar to Spring's TransactionTemplate: runs callbacks
/// according to a [`TransactionDefinition`].
#[derive(Debug)]
pub struct TransactionTemplate<M: TransactionManager> {
    manager: M,
    defaults: TransactionDefinition,
}

impl<M: TransactionManager> TransactionTemplate<M> {
    pub fn new(manager: M) -> Self {
        Self {
            manager,
            defaults: TransactionDefinition::default(),
        }
    }
    pub fn with_defaults(mut self, def: TransactionDefinition) -> Self {
        self.defaults = def;
        self
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn execute<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&StatefulTransaction) -> Result<R, E>,
        E: From<TxError>,
    {
        self.execute_with(&self.defaults, f)
    }

    /// Run `f` according to `def.propagation`. A joined transaction is left for
    /// its owner to terminate; a new one is demarcated with `execute_in_context`.
    pub fn execute_with<R, E, F>(&self, def: &TransactionDefinition, f: F) -> Result<R, E>
    where
        F: FnOnce(&StatefulTransaction) -> Result<R, E>,
        E: From<TxError>,
    {
        let joinable = match def.propagation {
            Propagation::RequiresNew => None,
            Propagation::Required | Propagation::Mandatory => self
                .manager
                .current_transaction()
                .filter(|tx| tx.is_live()),
        };
        if let Some(tx) = joinable {
            debug!(tx = tx.id(), "joining bound transaction");
            return f(&tx);
        }
        if def.propagation == Propagation::Mandatory {
            return Err(E::from(TxError::Propagation {
                propagation: Propagation::Mandatory,
                reason: "no live transaction bound to this context",
            }));
        }
        let tx = self.manager.open_transaction_with(def)?;
        self.manager
            .execute_in_context(Rc::clone(&tx), || f(&tx))
    }
}
