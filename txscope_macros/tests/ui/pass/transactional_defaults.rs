use txscope::{transactional, TxError};

#[transactional]
fn answer() -> Result<i64, TxError> {
    Ok(42)
}

fn main() {
    // Nothing is installed, so the call reports the missing configuration.
    assert!(matches!(answer(), Err(TxError::NotConfigured)));
}
