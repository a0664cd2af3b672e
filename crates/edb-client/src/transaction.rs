//! Transaction state machine.
//!
//! A [`Transaction`] is bound to one [`Connection`] and moves through
//!
//! ```text
//! New -> Started -> Committed
//!                -> RolledBack
//!                -> Failed
//! ```
//!
//! `Committed`, `RolledBack` and `Failed` are terminal. A transaction started
//! while another one is open on the same connection becomes a savepoint block
//! nested in it: it inherits unset attributes from the top-level transaction
//! and must not contradict the ones that are set.
//!
//! ## Example
//!
//! ```rust,ignore
//! use edb_client::{IsolationLevel, Transaction, TransactionOptions};
//!
//! let options = TransactionOptions::new().isolation(IsolationLevel::Serializable);
//! let tx = Transaction::new(conn.clone(), options);
//!
//! let total = tx
//!     .run(|tx| async move {
//!         tx.execute("UPDATE Account SET balance := balance - 10").await?;
//!
//!         // A nested block is a savepoint inside `tx`.
//!         let nested = Transaction::new(tx.connection().clone(), Default::default());
//!         nested.run(|n| async move { n.execute("INSERT Audit").await }).await?;
//!         Ok::<_, edb_client::Error>(10)
//!     })
//!     .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::connection::{Connection, TopTransaction};
use crate::error::{Error, Result};
use crate::options::TransactionOptions;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Serializable (the server default).
    Serializable,
    /// Repeatable read.
    RepeatableRead,
}

impl IsolationLevel {
    /// The isolation clause used in `START TRANSACTION`.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Serializable => "SERIALIZABLE",
            Self::RepeatableRead => "REPEATABLE READ",
        }
    }

    /// The option name of this level.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Serializable => "serializable",
            Self::RepeatableRead => "repeatable_read",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "serializable" => Ok(Self::Serializable),
            "repeatable_read" => Ok(Self::RepeatableRead),
            other => Err(Error::Config(format!(
                "isolation is expected to be either of serializable, repeatable_read, got {other:?}"
            ))),
        }
    }
}

/// Lifecycle state of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Created, not yet started.
    New,
    /// Started and usable.
    Started,
    /// Committed (terminal).
    Committed,
    /// Rolled back (terminal).
    RolledBack,
    /// A control statement failed (terminal).
    Failed,
}

impl TransactionState {
    /// Lowercase state name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Started => "started",
            Self::Committed => "committed",
            Self::RolledBack => "rolledback",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

/// Build the statement that opens a top-level transaction.
#[must_use]
pub fn start_statement(
    isolation: Option<IsolationLevel>,
    readonly: Option<bool>,
    deferrable: Option<bool>,
) -> String {
    let mut query = String::from("START TRANSACTION");
    if let Some(isolation) = isolation {
        query.push_str(" ISOLATION ");
        query.push_str(isolation.as_sql());
    }
    match readonly {
        Some(true) => query.push_str(" READ ONLY"),
        Some(false) => query.push_str(" READ WRITE"),
        None => {}
    }
    match deferrable {
        Some(true) => query.push_str(" DEFERRABLE"),
        Some(false) => query.push_str(" NOT DEFERRABLE"),
        None => {}
    }
    query.push(';');
    query
}

fn check_state_base(state: TransactionState, op: &str) -> Result<()> {
    let reason = match state {
        TransactionState::Committed => "is already committed",
        TransactionState::RolledBack => "is already rolled back",
        TransactionState::Failed => "is in error state",
        TransactionState::New | TransactionState::Started => return Ok(()),
    };
    Err(Error::Interface(format!(
        "cannot {op}; the transaction {reason}"
    )))
}

fn check_state(state: TransactionState, op: &str) -> Result<()> {
    if state == TransactionState::New {
        return Err(Error::Interface(format!(
            "cannot {op}; the transaction is not yet started"
        )));
    }
    check_state_base(state, op)
}

fn describe<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "unset".to_string(), |v| v.to_string())
}

#[derive(Debug)]
struct TxState {
    isolation: Option<IsolationLevel>,
    readonly: Option<bool>,
    deferrable: Option<bool>,
    state: TransactionState,
    nested: bool,
    savepoint: Option<String>,
    managed: bool,
}

struct TransactionInner {
    id: u64,
    connection: Connection,
    state: Mutex<TxState>,
}

/// A transaction or savepoint block on one connection.
///
/// Cloning yields another handle to the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

/// Marks the transaction failed if a control statement is abandoned
/// mid-flight.
struct PendingControl<'a> {
    tx: &'a Transaction,
    armed: bool,
}

impl Drop for PendingControl<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tx.inner.state.lock().state = TransactionState::Failed;
            self.tx.inner.connection.clear_top_transaction(self.tx.inner.id);
        }
    }
}

/// A managed block entered with [`Transaction::enter_managed`].
///
/// While the block is alive, [`Transaction::commit`] and
/// [`Transaction::rollback`] are rejected and the transaction can only be
/// finished through the block. Dropping it leaves managed mode.
#[must_use = "managed mode ends as soon as the block is dropped"]
pub struct ManagedBlock {
    tx: Transaction,
}

impl ManagedBlock {
    /// The transaction this block manages.
    #[must_use]
    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Commit, or release the savepoint.
    pub async fn commit(&self) -> Result<()> {
        self.tx.commit_inner().await
    }

    /// Roll back, or roll back to the savepoint.
    pub async fn rollback(&self) -> Result<()> {
        self.tx.rollback_inner().await
    }
}

impl Drop for ManagedBlock {
    fn drop(&mut self) {
        self.tx.inner.state.lock().managed = false;
    }
}

impl fmt::Debug for ManagedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ManagedBlock").field(&self.tx).finish()
    }
}

impl Transaction {
    /// Create a transaction on `connection` with the given attributes.
    #[must_use]
    pub fn new(connection: Connection, options: TransactionOptions) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
                connection,
                state: Mutex::new(TxState {
                    isolation: options.isolation,
                    readonly: options.readonly,
                    deferrable: options.deferrable,
                    state: TransactionState::New,
                    nested: false,
                    savepoint: None,
                    managed: false,
                }),
            }),
        }
    }

    /// The connection this transaction runs on.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner.state.lock().state
    }

    /// Whether the transaction is started and not yet finished.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Started
    }

    /// Whether this is a savepoint block inside another transaction.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.inner.state.lock().nested
    }

    /// Savepoint identifier of a nested transaction.
    #[must_use]
    pub fn savepoint_name(&self) -> Option<String> {
        self.inner.state.lock().savepoint.clone()
    }

    /// Isolation level, including one inherited at start.
    #[must_use]
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.inner.state.lock().isolation
    }

    /// Read-only flag, including one inherited at start.
    #[must_use]
    pub fn readonly(&self) -> Option<bool> {
        self.inner.state.lock().readonly
    }

    /// Deferrable flag, including one inherited at start.
    #[must_use]
    pub fn deferrable(&self) -> Option<bool> {
        self.inner.state.lock().deferrable
    }

    /// Enter the transaction or savepoint block.
    pub async fn start(&self) -> Result<()> {
        let query = self.make_start_query()?;
        self.execute_control(&query, TransactionState::Started)
            .await
    }

    /// Commit the transaction, or release the savepoint of a nested one.
    ///
    /// Rejected inside [`run`](Self::run).
    pub async fn commit(&self) -> Result<()> {
        self.reject_managed("commit")?;
        self.commit_inner().await
    }

    /// Roll the transaction back, or roll back to the savepoint of a nested
    /// one.
    ///
    /// Rejected inside [`run`](Self::run).
    pub async fn rollback(&self) -> Result<()> {
        self.reject_managed("rollback")?;
        self.rollback_inner().await
    }

    /// Execute a query inside the transaction.
    pub async fn execute(&self, query: &str) -> Result<()> {
        check_state(self.state(), "execute")?;
        self.inner.connection.execute(query).await
    }

    /// Run `work` inside this transaction.
    ///
    /// Starts the transaction, runs `work`, then commits if it returned `Ok`
    /// or rolls back if it returned `Err`. A failed rollback is logged and
    /// the error from `work` is returned.
    pub async fn run<F, Fut, T, E>(&self, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let block = self.enter_managed()?;

        self.start().await?;
        match work(self.clone()).await {
            Ok(value) => {
                block.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = block.rollback().await {
                    tracing::warn!(
                        transaction = self.inner.id,
                        error = %rollback_err,
                        "rollback after failed transaction block failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Enter managed mode without starting the transaction.
    ///
    /// This is the building block of [`run`](Self::run) for callers that
    /// drive the start, the work and the finish themselves. Fails if the
    /// transaction is already in a managed block.
    pub fn enter_managed(&self) -> Result<ManagedBlock> {
        let mut st = self.inner.state.lock();
        if st.managed {
            return Err(Error::Interface(
                "cannot enter context: already in a managed transaction block".into(),
            ));
        }
        st.managed = true;
        Ok(ManagedBlock { tx: self.clone() })
    }

    fn reject_managed(&self, op: &str) -> Result<()> {
        if self.inner.state.lock().managed {
            return Err(Error::Interface(format!(
                "cannot manually {op} from within a managed transaction block"
            )));
        }
        Ok(())
    }

    async fn commit_inner(&self) -> Result<()> {
        let query = self.make_finish_query("commit")?;
        self.execute_control(&query, TransactionState::Committed)
            .await
    }

    async fn rollback_inner(&self) -> Result<()> {
        let query = self.make_finish_query("rollback")?;
        self.execute_control(&query, TransactionState::RolledBack)
            .await
    }

    fn make_start_query(&self) -> Result<String> {
        let mut st = self.inner.state.lock();
        check_state_base(st.state, "start")?;
        if st.state == TransactionState::Started {
            return Err(Error::Interface(
                "cannot start; the transaction is already started".into(),
            ));
        }

        let conn = &self.inner.connection;
        let claim = TopTransaction {
            tx_id: self.inner.id,
            isolation: st.isolation,
            readonly: st.readonly,
            deferrable: st.deferrable,
        };
        let Some(top) = conn.claim_top_transaction(claim) else {
            return Ok(start_statement(st.isolation, st.readonly, st.deferrable));
        };

        let isolation = st.isolation.or(top.isolation);
        let readonly = st.readonly.or(top.readonly);
        let deferrable = st.deferrable.or(top.deferrable);
        if isolation != top.isolation {
            return Err(Error::Interface(format!(
                "nested transaction has a different isolation level: current {} != outer {}",
                describe(isolation),
                describe(top.isolation)
            )));
        }
        if readonly != top.readonly {
            return Err(Error::Interface(format!(
                "nested transaction has a different read-write mode: current {} != outer {}",
                describe(readonly),
                describe(top.readonly)
            )));
        }
        if deferrable != top.deferrable {
            return Err(Error::Interface(format!(
                "nested transaction has a different deferrable mode: current {} != outer {}",
                describe(deferrable),
                describe(top.deferrable)
            )));
        }

        let savepoint = conn.next_unique_id("savepoint");
        let query = format!("DECLARE SAVEPOINT {savepoint};");
        st.isolation = isolation;
        st.readonly = readonly;
        st.deferrable = deferrable;
        st.nested = true;
        st.savepoint = Some(savepoint);
        Ok(query)
    }

    fn make_finish_query(&self, op: &str) -> Result<String> {
        let st = self.inner.state.lock();
        check_state(st.state, op)?;
        self.inner.connection.clear_top_transaction(self.inner.id);

        let query = match (&st.savepoint, op) {
            (Some(id), "commit") => format!("RELEASE SAVEPOINT {id};"),
            (Some(id), _) => format!("ROLLBACK TO SAVEPOINT {id};"),
            (None, "commit") => "COMMIT;".to_string(),
            (None, _) => "ROLLBACK;".to_string(),
        };
        Ok(query)
    }

    async fn execute_control(&self, query: &str, success: TransactionState) -> Result<()> {
        let mut pending = PendingControl {
            tx: self,
            armed: true,
        };
        let result = self.inner.connection.privileged_execute(query).await;
        pending.armed = false;

        let mut st = self.inner.state.lock();
        match result {
            Ok(()) => {
                tracing::debug!(
                    transaction = self.inner.id,
                    savepoint = st.savepoint.as_deref(),
                    state = success.name(),
                    "transaction state changed"
                );
                st.state = success;
                Ok(())
            }
            Err(e) => {
                st.state = TransactionState::Failed;
                drop(st);
                self.inner.connection.clear_top_transaction(self.inner.id);
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        write!(f, "Transaction(state:{}", st.state.name())?;
        if let Some(isolation) = st.isolation {
            write!(f, " {isolation}")?;
        }
        if st.readonly == Some(true) {
            f.write_str(" readonly")?;
        }
        if st.deferrable == Some(true) {
            f.write_str(" deferrable")?;
        }
        f.write_str(")")
    }
}
