use txscope::{transactional, TxError};

struct Ledger {
    entries: Vec<String>,
}

impl Ledger {
    #[transactional(isolation = "read_committed")]
    pub fn record(&mut self, entry: String) -> Result<usize, TxError> {
        self.entries.push(entry);
        Ok(self.entries.len())
    }

    #[transactional(isolation = "repeatable_read", read_only)]
    pub fn count(&self) -> Result<usize, TxError> {
        Ok(self.entries.len())
    }
}

fn main() {
    let mut ledger = Ledger { entries: Vec::new() };
    let _ = ledger.record("opening balance".to_string());
    let _ = ledger.count();
}
