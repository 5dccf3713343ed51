use txscope::{transactional, TxError};

#[derive(Debug)]
enum AppError {
    Tx(TxError),
    Invalid(&'static str),
}

impl From<TxError> for AppError {
    fn from(e: TxError) -> Self {
        AppError::Tx(e)
    }
}

#[transactional(requires_new, isolation = "serializable", timeout_ms = 250)]
fn transfer(amount: i64) -> Result<i64, AppError> {
    if amount < 0 {
        return Err(AppError::Invalid("negative amount"));
    }
    let tx = txscope::config::transaction()?;
    let _ = tx.is_live();
    Ok(amount)
}

#[transactional(mandatory, read_only)]
fn audit<T: Into<i64>>(value: T) -> Result<i64, AppError> {
    Ok(value.into())
}

fn main() {
    let _ = transfer(10);
    let _ = audit(3i32);
}
