// Run with:
//   cargo run -p txscope --features libsql-backend --example libsql_transfer
// Moves balance between two accounts in a temp-file libsql database and shows
// that a failed transfer leaves both balances untouched.

use txscope::backends::LibsqlConnectionProvider;
use txscope::transactions::TransactionDefinition;
use txscope::{config, transactional, ConnectionProvider, TxError};

#[derive(Debug)]
enum TransferError {
    InsufficientFunds { account: i64, balance: i64 },
    Tx(TxError),
}

impl From<TxError> for TransferError {
    fn from(e: TxError) -> Self {
        TransferError::Tx(e)
    }
}

#[transactional(read_only)]
fn balance(account: i64) -> Result<i64, TxError> {
    let sql = format!("SELECT balance FROM accounts WHERE id = {account}");
    let rows = config::transaction()?.execute(&sql, |stmt| stmt.query(&[]))?;
    Ok(rows.first().and_then(|r| r.get_i64(0)).unwrap_or(0))
}

#[transactional]
fn adjust(account: i64, delta: i64) -> Result<(), TxError> {
    let sql = format!("UPDATE accounts SET balance = balance + {delta} WHERE id = {account}");
    config::transaction()?.execute(&sql, |stmt| stmt.execute(&[]))?;
    Ok(())
}

// Debit first, check afterwards: the rollback undoes the debit on failure.
#[transactional]
fn transfer(from: i64, to: i64, amount: i64) -> Result<(), TransferError> {
    adjust(from, -amount)?;
    adjust(to, amount)?;
    let remaining = balance(from)?;
    if remaining < 0 {
        return Err(TransferError::InsufficientFunds {
            account: from,
            balance: remaining + amount,
        });
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let provider = LibsqlConnectionProvider::open_local(dir.path().join("bank.sqlite3"))?;

    let conn = provider.open_connection(&TransactionDefinition::default())?;
    conn.execute_batch(
        "CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance INTEGER NOT NULL);
         INSERT INTO accounts (id, balance) VALUES (1, 100), (2, 0);",
    )?;
    conn.commit()?;
    conn.close()?;

    config::install_default(provider);

    match transfer(1, 2, 70) {
        Ok(()) => println!("transferred 70"),
        Err(e) => println!("transfer failed: {e:?}"),
    }
    match transfer(1, 2, 50) {
        Ok(()) => println!("transferred 50"),
        Err(e) => println!("transfer failed: {e:?}"),
    }
    println!("account 1: {}", balance(1)?);
    println!("account 2: {}", balance(2)?);
    Ok(())
}
