use std::sync::Arc;

use txscope::transactions::{
    Isolation, LocalTransactionManager, Propagation, TransactionDefinition, TransactionManager,
    TransactionManagerExt,
};
use txscope::{ParamValue, Row};
use txscope_core::testing::{Event, MockProvider};

#[test]
fn facade_exposes_core_contract() {
    let row = Row::new(vec![ParamValue::I64(2), ParamValue::String("a".into())]);
    assert_eq!(row.get_i64(0), Some(2));
    assert_eq!(row.get_str(1), Some("a"));

    let def = TransactionDefinition::default();
    assert_eq!(def.propagation, Propagation::Required);
    assert_eq!(def.isolation, Isolation::Default);
}

#[test]
fn managers_work_through_the_facade() {
    let provider = MockProvider::new();
    let mgr = LocalTransactionManager::new(Arc::new(provider.clone()));
    let outer = mgr.get_transaction().expect("open outer");
    let inner = mgr.open_transaction().expect("open inner");
    let n = mgr
        .execute_in_context(inner, || {
            let tx = mgr.get_transaction()?;
            tx.execute("UPDATE t SET v = 1", |stmt| stmt.execute(&[]))
        })
        .expect("scope succeeds");
    assert_eq!(n, 1);
    assert!(outer.is_live());
    assert_eq!(mgr.current_transaction().map(|tx| tx.id()), Some(outer.id()));
    assert_eq!(
        provider.events_for(1),
        vec![
            Event::Opened(1),
            Event::Prepared(1, "UPDATE t SET v = 1".into()),
            Event::Executed(1, "UPDATE t SET v = 1".into()),
            Event::StatementClosed(1),
            Event::Committed(1),
            Event::Closed(1),
        ]
    );
}
