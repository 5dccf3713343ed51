use std::time::Duration;

use serial_test::serial;
use txscope::transactions::{Isolation, Propagation, TransactionDefinition};
use txscope::{config, transactional, TxError};
use txscope_core::testing::{Event, Faults, MockProvider};

#[derive(Debug, PartialEq)]
enum AppError {
    Tx(String),
    Rejected(&'static str),
}

impl From<TxError> for AppError {
    fn from(e: TxError) -> Self {
        AppError::Tx(e.to_string())
    }
}

fn install_mock() -> MockProvider {
    let provider = MockProvider::new();
    config::uninstall();
    config::install_default(provider.clone());
    provider
}

#[transactional]
fn insert_item(name: &'static str) -> Result<u64, AppError> {
    let tx = config::transaction()?;
    let n = tx.execute(name, |stmt| stmt.execute(&[]))?;
    Ok(n)
}

#[transactional]
fn reject() -> Result<(), AppError> {
    config::transaction()?.execute("INSERT INTO items VALUES ('x')", |stmt| stmt.execute(&[]))?;
    Err(AppError::Rejected("x"))
}

#[transactional]
fn outer_joins_inner() -> Result<(u64, u64), AppError> {
    let outer = config::transaction()?.id();
    insert_item("INSERT INTO items VALUES ('a')")?;
    let inner = config::transaction()?.id();
    Ok((outer, inner))
}

#[transactional(requires_new)]
fn independent() -> Result<u64, AppError> {
    Ok(config::transaction()?.id())
}

#[transactional]
fn outer_suspends_for_independent() -> Result<(u64, u64, u64), AppError> {
    let before = config::transaction()?.id();
    let inner = independent()?;
    let after = config::transaction()?.id();
    Ok((before, inner, after))
}

#[transactional(mandatory)]
fn needs_caller_transaction() -> Result<u64, AppError> {
    Ok(config::transaction()?.id())
}

#[transactional]
fn calls_mandatory() -> Result<bool, AppError> {
    let own = config::transaction()?.id();
    Ok(needs_caller_transaction()? == own)
}

#[transactional(requires_new, read_only, isolation = "repeatable_read", timeout_ms = 1500)]
fn tuned() -> Result<(), TxError> {
    Ok(())
}

#[transactional]
fn explode() -> Result<(), AppError> {
    panic!("unexpected state")
}

#[test]
#[serial]
fn commits_when_the_function_succeeds() {
    let provider = install_mock();
    assert_eq!(insert_item("INSERT INTO items VALUES ('a')"), Ok(1));
    let events = provider.events();
    assert_eq!(events.first(), Some(&Event::Opened(0)));
    assert_eq!(
        &events[events.len() - 2..],
        &[Event::Committed(0), Event::Closed(0)]
    );
    config::uninstall();
}

#[test]
#[serial]
fn rolls_back_and_returns_the_function_error() {
    let provider = install_mock();
    assert_eq!(reject(), Err(AppError::Rejected("x")));
    let events = provider.events();
    assert!(!events.contains(&Event::Committed(0)));
    assert_eq!(
        &events[events.len() - 2..],
        &[Event::RolledBack(0), Event::Closed(0)]
    );
    config::uninstall();
}

#[test]
#[serial]
fn nested_required_calls_share_one_transaction() {
    let provider = install_mock();
    let (outer, inner) = outer_joins_inner().expect("outer succeeds");
    assert_eq!(outer, inner);
    assert_eq!(provider.opened(), 1);
    let committed = provider
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Committed(_)))
        .count();
    assert_eq!(committed, 1, "only the outermost boundary commits");
    config::uninstall();
}

#[test]
#[serial]
fn requires_new_suspends_and_restores_the_caller() {
    let provider = install_mock();
    let (before, inner, after) = outer_suspends_for_independent().expect("succeeds");
    assert_ne!(before, inner);
    assert_eq!(before, after);
    assert_eq!(provider.opened(), 2);
    assert_eq!(
        provider.events_for(1),
        vec![Event::Opened(1), Event::Committed(1), Event::Closed(1)]
    );
    config::uninstall();
}

#[test]
#[serial]
fn mandatory_needs_a_bound_transaction() {
    let provider = install_mock();
    let err = needs_caller_transaction().expect_err("nothing bound");
    assert!(matches!(err, AppError::Tx(msg) if msg.contains("Mandatory")));
    assert_eq!(provider.opened(), 0);

    assert_eq!(calls_mandatory(), Ok(true));
    config::uninstall();
}

#[test]
#[serial]
fn options_reach_the_connection_provider() {
    let provider = install_mock();
    tuned().expect("succeeds");
    assert_eq!(
        provider.definitions(),
        vec![TransactionDefinition {
            propagation: Propagation::RequiresNew,
            isolation: Isolation::RepeatableRead,
            read_only: true,
            timeout: Some(Duration::from_millis(1500)),
        }]
    );
    config::uninstall();
}

#[test]
#[serial]
fn commit_failure_surfaces_as_the_function_error() {
    let provider = install_mock();
    provider.set_faults(Faults {
        commit: true,
        ..Faults::default()
    });
    let err = insert_item("INSERT INTO items VALUES ('a')").expect_err("commit fails");
    assert_eq!(err, AppError::Tx("backend error".into()));
    assert_eq!(
        &provider.events()[provider.events().len() - 2..],
        &[Event::RolledBack(0), Event::Closed(0)]
    );
    config::uninstall();
}

#[test]
#[serial]
fn panics_roll_back_before_unwinding_further() {
    let provider = install_mock();
    let res = std::panic::catch_unwind(explode);
    assert!(res.is_err());
    assert_eq!(
        provider.events(),
        vec![Event::Opened(0), Event::RolledBack(0), Event::Closed(0)]
    );
    config::uninstall();
}

#[test]
#[serial]
fn unconfigured_calls_report_it() {
    config::uninstall();
    assert_eq!(
        insert_item("INSERT INTO items VALUES ('a')"),
        Err(AppError::Tx("no transaction manager configured".into()))
    );
}
