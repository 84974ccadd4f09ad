/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Test transactions against an in-memory repository

extern crate cdo_core;
extern crate env_logger;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cdo_core::*;
use cdo_core::error::{StoreError, TransactionError};
use cdo_core::store::ManualClock;

fn open_store() -> Arc<MemoryStore> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(MemoryStore::with_clock(Box::new(ManualClock::new(1000))))
}

fn open_session(store: &Arc<MemoryStore>) -> Session {
    let session = Session::open(store.clone(), SessionConfig::default());
    session.register_package(PackageUnit::new("shop", vec![]));
    session
}

fn feature(name: &str) -> Feature {
    Feature::new(name)
}

// Commit one product with name and price; return its persistent id
fn create_product(session: &Session, name: &str, price: i64) -> ObjectId {
    let tx = session.open_transaction(BranchId::MAIN).unwrap();
    let product = CdoObject::new(ClassRef::new("shop", "Product"));
    product.set_transient(feature("name"), Value::from(name));
    product.set_transient(feature("price"), Value::from(price));
    tx.attach(&product).unwrap();
    tx.commit().unwrap().unwrap();
    let id = product.id();
    tx.close();
    id
}

// Records the kinds of events received
fn recorder() -> (Arc<dyn ViewListener>, Arc<Mutex<Vec<&'static str>>>) {
    let seen = Arc::new(Mutex::new(vec![]));
    let log = seen.clone();
    let listener: Arc<dyn ViewListener> = Arc::new(move |_: ViewId, event: &ViewEvent| -> Result<()> {
        let name = match *event {
            ViewEvent::Invalidation { .. } => "invalidation",
            ViewEvent::Conflict { .. } => "conflict",
            ViewEvent::Started => "started",
            ViewEvent::Finished { kind: FinishedKind::Committed, .. } => "committed",
            ViewEvent::Finished { kind: FinishedKind::RolledBack, .. } => "rolled back",
        };
        log.lock().unwrap().push(name);
        Ok(())
    });
    (listener, seen)
}

#[test]
fn commit_new_objects() {
    let store = open_store();
    let session = open_session(&store);
    let tx = session.open_transaction(BranchId::MAIN).unwrap();

    let shop = CdoObject::new_resource(ClassRef::new("shop", "Shop"));
    let apple = CdoObject::new(ClassRef::new("shop", "Product"));
    apple.set_transient(feature("name"), Value::from("apple"));
    let shop_id = tx.attach(&shop).unwrap();
    let apple_id = tx.attach(&apple).unwrap();
    assert!(shop_id.is_temporary());
    assert!(apple_id.is_temporary());
    assert_ne!(shop_id, apple_id);
    tx.add(&shop, "products", apple_id).unwrap();

    assert_eq!(shop.state(), ObjectState::New);
    assert!(tx.is_dirty());
    assert_eq!(tx.new_objects().len(), 2);
    // changes to new objects live in their revisions
    assert!(tx.revision_deltas().is_empty());

    let info = tx.commit().unwrap().expect("something to commit");
    assert_eq!(info.sequence, 1);
    assert_eq!(info.time, 1000);
    assert_eq!(info.new_objects.len(), 2);
    assert!(info.dirty_objects.is_empty());
    let new_shop = info.id_mappings.get(shop_id).unwrap();
    let new_apple = info.id_mappings.get(apple_id).unwrap();
    assert!(new_shop.is_persistent());
    assert!(new_apple.is_persistent());

    assert_eq!(shop.id(), new_shop);
    assert_eq!(shop.state(), ObjectState::Clean);
    assert_eq!(shop.version(), Some(1));
    assert_eq!(shop.get(&feature("products")), Some(Value::List(vec![Value::Ref(new_apple)])));
    assert!(!tx.is_dirty());
    assert!(tx.new_objects().is_empty());

    assert!(store.has_package("shop"));
    assert_eq!(session.package_state("shop"), Some(PackageState::Loaded));
    assert_eq!(store.last_sequence(), 1);

    // nothing left to commit
    assert_eq!(tx.commit().unwrap(), None);

    let other = open_session(&store);
    let view = other.open_view(BranchId::MAIN.head()).unwrap();
    let loaded = view.get_object(new_apple).unwrap();
    assert_eq!(loaded.state(), ObjectState::Clean);
    assert_eq!(view.read(&loaded, &feature("name")).unwrap(), Some(Value::from("apple")));
}

#[test]
fn remote_commit_invalidates_clean_objects() {
    let store = open_store();
    let writer = open_session(&store);
    let id = create_product(&writer, "apple", 10);

    let reader = open_session(&store);
    let view = reader.open_view(BranchId::MAIN.head()).unwrap();
    let (listener, seen) = recorder();
    view.add_listener(listener);
    let product = view.get_object(id).unwrap();
    assert_eq!(product.state(), ObjectState::Clean);
    assert_eq!(product.version(), Some(1));

    let tx = writer.open_transaction(BranchId::MAIN).unwrap();
    let p = tx.get_object(id).unwrap();
    tx.set(&p, "price", 12i64).unwrap();
    assert_eq!(p.state(), ObjectState::Dirty);
    let info = tx.commit().unwrap().unwrap();
    assert_eq!(info.dirty_objects, vec![id]);
    assert_eq!(p.state(), ObjectState::Clean);
    assert_eq!(p.version(), Some(2));

    // nothing happens until the invalidation is processed
    assert_eq!(product.state(), ObjectState::Clean);
    assert_eq!(reader.process_invalidations(), 1);
    assert_eq!(product.state(), ObjectState::Proxy);
    assert_eq!(*seen.lock().unwrap(), vec!["invalidation"]);
    assert_eq!(reader.last_update_time(), info.time);

    assert_eq!(view.read(&product, &feature("price")).unwrap(), Some(Value::Int(12)));
    assert_eq!(product.state(), ObjectState::Clean);
    assert_eq!(product.version(), Some(2));
}

#[test]
fn local_views_follow_own_commits() {
    let store = open_store();
    let session = open_session(&store);
    let id = create_product(&session, "apple", 10);

    let view = session.open_view(BranchId::MAIN.head()).unwrap();
    let seen_by_view = view.get_object(id).unwrap();
    let tx = session.open_transaction(BranchId::MAIN).unwrap();
    let p = tx.get_object(id).unwrap();
    assert!(!p.ptr_eq(&seen_by_view));
    tx.set(&p, "name", "green apple").unwrap();
    tx.commit().unwrap().unwrap();

    assert_eq!(seen_by_view.state(), ObjectState::Proxy);
    assert_eq!(view.read(&seen_by_view, &feature("name")).unwrap(), Some(Value::from("green apple")));
    // served from the session's cache
    assert_eq!(session.process_invalidations(), 0);
}

#[test]
fn detach_and_commit() {
    let store = open_store();
    let session = open_session(&store);
    let id = create_product(&session, "apple", 10);

    let reader = open_session(&store);
    let view = reader.open_view(BranchId::MAIN.head()).unwrap();
    let seen = view.get_object(id).unwrap();

    let tx = session.open_transaction(BranchId::MAIN).unwrap();
    let p = tx.get_object(id).unwrap();
    tx.detach(&p).unwrap();
    assert_eq!(p.state(), ObjectState::Transient);
    assert_eq!(tx.detached_objects(), vec![id]);
    // values stay readable on the transient object
    assert_eq!(p.get(&feature("price")), Some(Value::Int(10)));

    let info = tx.commit().unwrap().unwrap();
    assert_eq!(info.detached_objects, vec![id]);
    assert!(tx.detached_objects().is_empty());

    assert_eq!(reader.process_invalidations(), 1);
    assert_eq!(seen.state(), ObjectState::Transient);
    match view.get_object(id) {
        Err(Error::Store(StoreError::NotFound(missing))) => assert_eq!(missing, id),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("detached object still visible"),
    }
}

#[test]
fn rollback_restores_detached_object() {
    let store = open_store();
    let session = open_session(&store);
    let tx = session.open_transaction(BranchId::MAIN).unwrap();
    let o = CdoObject::new(ClassRef::new("shop", "Product"));
    o.set_transient(feature("name"), Value::from("apple"));
    tx.attach(&o).unwrap();
    tx.commit().unwrap().unwrap();
    let id = o.id();
    assert!(id.is_persistent());
    assert_eq!(o.state(), ObjectState::Clean);

    let sp = tx.set_savepoint().unwrap();
    tx.detach(&o).unwrap();
    assert_eq!(o.state(), ObjectState::Transient);
    tx.rollback_to(sp).unwrap();

    assert_eq!(o.state(), ObjectState::Clean);
    assert_eq!(o.id(), id);
    assert_eq!(o.version(), Some(1));
    assert_eq!(tx.read(&o, &feature("name")).unwrap(), Some(Value::from("apple")));
    assert!(tx.get_object(id).unwrap().ptr_eq(&o));
    assert!(tx.detached_objects().is_empty());
    assert!(!tx.is_dirty());
}

#[test]
fn detach_then_reattach() {
    let store = open_store();
    let session = open_session(&store);
    let id = create_product(&session, "apple", 10);

    let tx = session.open_transaction(BranchId::MAIN).unwrap();
    let p = tx.get_object(id).unwrap();
    tx.detach(&p).unwrap();
    assert_eq!(tx.attach(&p).unwrap(), id);
    assert_eq!(p.id(), id);
    assert_eq!(p.state(), ObjectState::Dirty);
    assert!(tx.detached_objects().is_empty());
    assert_eq!(tx.read(&p, &feature("price")).unwrap(), Some(Value::Int(10)));

    // a new object detached in its own savepoint leaves no trace
    let n = CdoObject::new(ClassRef::new("shop", "Product"));
    tx.attach(&n).unwrap();
    tx.detach(&n).unwrap();
    assert!(tx.new_objects().is_empty());
    assert!(tx.detached_objects().is_empty());
}

#[test]
fn rollback_across_reattach_keeps_detach() {
    let store = open_store();
    let session = open_session(&store);
    let id = create_product(&session, "apple", 10);

    let tx = session.open_transaction(BranchId::MAIN).unwrap();
    let p = tx.get_object(id).unwrap();
    tx.detach(&p).unwrap();
    let sp = tx.set_savepoint().unwrap();
    assert_eq!(tx.attach(&p).unwrap(), id);
    assert!(tx.detached_objects().is_empty());

    tx.rollback_to(sp).unwrap();
    assert_eq!(p.state(), ObjectState::Transient);
    assert_eq!(tx.detached_objects(), vec![id]);
    assert_eq!(p.get(&feature("price")), Some(Value::Int(10)));

    let info = tx.commit().unwrap().unwrap();
    assert_eq!(info.detached_objects, vec![id]);

    let reader = open_session(&store);
    let view = reader.open_view(BranchId::MAIN.head()).unwrap();
    match view.get_object(id) {
        Err(Error::Store(StoreError::NotFound(missing))) => assert_eq!(missing, id),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("detached object still visible"),
    }
}

#[test]
fn remote_detach_removes_local_references() {
    let store = open_store();
    let session = open_session(&store);
    let apple = create_product(&session, "apple", 10);
    let pear = create_product(&session, "pear", 5);

    let tx = session.open_transaction(BranchId::MAIN).unwrap();
    let basket = CdoObject::new(ClassRef::new("shop", "Basket"));
    basket.set_transient(feature("items"), Value::List(vec![Value::Ref(apple), Value::Ref(pear)]));
    basket.set_transient(feature("favourite"), Value::Ref(apple));
    tx.attach(&basket).unwrap();
    let p = tx.get_object(pear).unwrap();
    tx.set(&p, "related", apple).unwrap();

    let remote = open_session(&store);
    let rtx = remote.open_transaction(BranchId::MAIN).unwrap();
    let a = rtx.get_object(apple).unwrap();
    rtx.detach(&a).unwrap();
    rtx.commit().unwrap().unwrap();
    assert_eq!(session.process_invalidations(), 1);

    assert_eq!(basket.get(&feature("items")), Some(Value::List(vec![Value::Ref(pear)])));
    assert_eq!(basket.get(&feature("favourite")), None);
    assert_eq!(tx.read(&p, &feature("related")).unwrap(), None);
    assert_eq!(p.state(), ObjectState::Dirty);
    assert!(!tx.has_conflict());

    let info = tx.commit().unwrap().unwrap();
    assert_eq!(info.dirty_objects, vec![pear]);
    let basket_id = basket.id();
    assert!(basket_id.is_persistent());

    let reader = open_session(&store);
    let view = reader.open_view(BranchId::MAIN.head()).unwrap();
    let b = view.get_object(basket_id).unwrap();
    assert_eq!(view.read(&b, &feature("items")).unwrap(), Some(Value::List(vec![Value::Ref(pear)])));
    assert_eq!(view.read(&b, &feature("favourite")).unwrap(), None);
    let p2 = view.get_object(pear).unwrap();
    assert_eq!(view.read(&p2, &feature("related")).unwrap(), None);
    assert_eq!(view.read(&p2, &feature("name")).unwrap(), Some(Value::from("pear")));
}

#[test]
fn savepoints() {
    let store = open_store();
    let session = open_session(&store);
    let id = create_product(&session, "apple", 10);

    let tx = session.open_transaction(BranchId::MAIN).unwrap();
    let (listener, seen) = recorder();
    tx.add_listener(listener);
    let p = tx.get_object(id).unwrap();
    tx.set(&p, "price", 11i64).unwrap();
    let sp = tx.set_savepoint().unwrap();
    assert_eq!(sp.index(), 1);
    assert_eq!(tx.savepoint_count(), 2);

    tx.set(&p, "price", 12i64).unwrap();
    let n = CdoObject::new(ClassRef::new("shop", "Product"));
    tx.attach(&n).unwrap();
    assert_eq!(tx.new_objects().len(), 1);

    tx.rollback_to(sp).unwrap();
    assert_eq!(tx.savepoint_count(), 2);
    assert_eq!(p.state(), ObjectState::Dirty);
    assert_eq!(tx.read(&p, &feature("price")).unwrap(), Some(Value::Int(11)));
    assert_eq!(n.state(), ObjectState::Transient);
    assert!(tx.new_objects().is_empty());
    assert!(tx.is_dirty());

    // the savepoint stays usable
    tx.set(&p, "price", 13i64).unwrap();
    tx.rollback_to(sp).unwrap();
    assert_eq!(tx.read(&p, &feature("price")).unwrap(), Some(Value::Int(11)));

    tx.rollback().unwrap();
    assert_eq!(p.state(), ObjectState::Clean);
    assert_eq!(tx.read(&p, &feature("price")).unwrap(), Some(Value::Int(10)));
    assert!(!tx.is_dirty());
    assert_eq!(tx.savepoint_count(), 1);
    assert!(tx.rollback_to(sp).is_err());

    assert_eq!(*seen.lock().unwrap(), vec!["started", "rolled back", "rolled back", "rolled back"]);
}

#[test]
fn savepoints_of_new_objects() {
    let store = open_store();
    let session = open_session(&store);
    let tx = session.open_transaction(BranchId::MAIN).unwrap();

    let n = CdoObject::new(ClassRef::new("shop", "Product"));
    n.set_transient(feature("name"), Value::from("plum"));
    let temp = tx.attach(&n).unwrap();
    let sp = tx.set_savepoint().unwrap();
    tx.set(&n, "name", "pear").unwrap();
    tx.detach(&n).unwrap();
    assert!(tx.new_objects().is_empty());

    tx.rollback_to(sp).unwrap();
    assert_eq!(n.state(), ObjectState::New);
    assert_eq!(n.id(), temp);
    assert_eq!(tx.read(&n, &feature("name")).unwrap(), Some(Value::from("plum")));
    assert_eq!(tx.new_objects().len(), 1);

    let info = tx.commit().unwrap().unwrap();
    assert_eq!(info.new_objects, vec![n.id()]);
}

#[test]
fn temporary_ids_stay_unique() {
    let store = open_store();
    let session = open_session(&store);
    let tx = session.open_transaction(BranchId::MAIN).unwrap();

    let a = CdoObject::new(ClassRef::new("shop", "Product"));
    let first = tx.attach(&a).unwrap();
    tx.rollback().unwrap();
    let b = CdoObject::new(ClassRef::new("shop", "Product"));
    let second = tx.attach(&b).unwrap();
    assert_ne!(first, second);
}

#[test]
fn locks_block_other_commits() {
    let store = open_store();
    let owner = open_session(&store);
    let id = create_product(&owner, "apple", 10);

    let holder = owner.open_transaction(BranchId::MAIN).unwrap();
    let locked = holder.get_object(id).unwrap();
    holder.lock_objects(&[locked.clone()]).unwrap();
    assert_eq!(holder.locked_objects(), vec![id]);

    let other = open_session(&store);
    let tx = other.open_transaction(BranchId::MAIN).unwrap();
    let p = tx.get_object(id).unwrap();
    assert!(tx.lock_objects(&[p.clone()]).is_err());
    tx.set(&p, "price", 11i64).unwrap();
    match tx.commit() {
        Err(Error::Transaction(TransactionError::Commit(StoreError::Locked(ids)))) => assert_eq!(ids, vec![id]),
        other => panic!("expected a lock failure, got {:?}", other),
    }
    // a refused commit leaves the transaction as it was
    assert!(tx.is_dirty());
    assert_eq!(p.state(), ObjectState::Dirty);

    holder.unlock_objects(None);
    assert!(holder.locked_objects().is_empty());
    let info = tx.commit().unwrap().unwrap();
    assert_eq!(info.dirty_objects, vec![id]);
}

#[test]
fn locks_released_on_commit() {
    let store = open_store();
    let session = open_session(&store);
    let id = create_product(&session, "apple", 10);

    let tx = session.open_transaction(BranchId::MAIN).unwrap();
    let p = tx.get_object(id).unwrap();
    tx.lock_objects(&[p.clone()]).unwrap();
    tx.set(&p, "price", 11i64).unwrap();
    tx.commit().unwrap().unwrap();
    assert!(tx.locked_objects().is_empty());

    let other = open_session(&store);
    let tx2 = other.open_transaction(BranchId::MAIN).unwrap();
    let p2 = tx2.get_object(id).unwrap();
    tx2.lock_objects(&[p2]).unwrap();
}

#[test]
fn failing_listener_is_isolated() {
    let store = open_store();
    let session = open_session(&store);
    let tx = session.open_transaction(BranchId::MAIN).unwrap();

    let failing: Arc<dyn ViewListener> = Arc::new(|_: ViewId, _: &ViewEvent| -> Result<()> {
        Err(Error::Listener("listener broke".to_string()))
    });
    tx.add_listener(failing.clone());
    let (listener, seen) = recorder();
    tx.add_listener(listener);

    let n = CdoObject::new(ClassRef::new("shop", "Product"));
    tx.attach(&n).unwrap();
    assert!(tx.commit().unwrap().is_some());
    assert_eq!(*seen.lock().unwrap(), vec!["started", "committed"]);

    tx.remove_listener(&failing);
    let m = CdoObject::new(ClassRef::new("shop", "Product"));
    tx.attach(&m).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["started", "committed", "started"]);
}

struct Veto;
impl TransactionHandler for Veto {
    fn committing(&self, ctx: &CommitContext) -> Result<()> {
        if ctx.new_objects.values().any(|o| o.get(&Feature::new("name")) == Some(Value::from("forbidden"))) {
            return Err(Error::illegal("forbidden product"));
        }
        Ok(())
    }
}

#[test]
fn handler_vetoes_commit() {
    let store = open_store();
    let session = open_session(&store);
    let tx = session.open_transaction(BranchId::MAIN).unwrap();
    let veto: Arc<dyn TransactionHandler> = Arc::new(Veto);
    tx.add_handler(veto.clone());

    let n = CdoObject::new(ClassRef::new("shop", "Product"));
    n.set_transient(feature("name"), Value::from("forbidden"));
    tx.attach(&n).unwrap();
    match tx.commit() {
        Err(Error::Transaction(TransactionError::Vetoed(_))) => {}
        other => panic!("expected a veto, got {:?}", other),
    }
    assert_eq!(n.state(), ObjectState::New);
    assert_eq!(store.last_sequence(), 0);

    tx.remove_handler(&veto);
    assert!(tx.commit().unwrap().is_some());
}

#[test]
fn export_and_import_changes() {
    let store = open_store();
    let session = open_session(&store);
    let id = create_product(&session, "apple", 10);

    let tx = session.open_transaction(BranchId::MAIN).unwrap();
    let p = tx.get_object(id).unwrap();
    tx.set(&p, "price", 11i64).unwrap();
    let n = CdoObject::new(ClassRef::new("shop", "Product"));
    n.set_transient(feature("name"), Value::from("plum"));
    let exported_id = tx.attach(&n).unwrap();
    tx.set_savepoint().unwrap();
    tx.set(&n, "name", "pear").unwrap();

    let mut buf = Vec::new();
    tx.export_changes(&mut buf).unwrap();
    tx.rollback().unwrap();

    let other = open_session(&store);
    let tx2 = other.open_transaction(BranchId::MAIN).unwrap();
    let mapper = tx2.import_changes(&mut &buf[..], true).unwrap();
    assert_eq!(tx2.savepoint_count(), 2);
    assert!(tx2.is_dirty());
    let imported_id = mapper.get(exported_id).unwrap();
    assert!(imported_id.is_temporary());
    let imported = tx2.get_object(imported_id).unwrap();
    assert_eq!(imported.state(), ObjectState::New);
    assert_eq!(tx2.read(&imported, &feature("name")).unwrap(), Some(Value::from("pear")));
    let p2 = tx2.get_object(id).unwrap();
    assert_eq!(p2.state(), ObjectState::Dirty);
    assert_eq!(tx2.read(&p2, &feature("price")).unwrap(), Some(Value::Int(11)));

    let info = tx2.commit().unwrap().unwrap();
    assert_eq!(info.new_objects.len(), 1);
    assert_eq!(info.dirty_objects, vec![id]);
}

#[test]
fn import_without_savepoints() {
    let store = open_store();
    let session = open_session(&store);
    let tx = session.open_transaction(BranchId::MAIN).unwrap();
    let n = CdoObject::new(ClassRef::new("shop", "Product"));
    tx.attach(&n).unwrap();
    tx.set_savepoint().unwrap();
    tx.set(&n, "name", "pear").unwrap();
    let mut buf = Vec::new();
    tx.export_changes(&mut buf).unwrap();

    let tx2 = session.open_transaction(BranchId::MAIN).unwrap();
    tx2.import_changes(&mut &buf[..], false).unwrap();
    assert_eq!(tx2.savepoint_count(), 1);
    let objects = tx2.new_objects();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].get(&feature("name")), Some(Value::from("pear")));
}

#[test]
fn failed_import_changes_nothing() {
    let store = open_store();
    let session = open_session(&store);
    let id = create_product(&session, "apple", 10);

    let tx = session.open_transaction(BranchId::MAIN).unwrap();
    let n = CdoObject::new(ClassRef::new("shop", "Product"));
    n.set_transient(feature("name"), Value::from("plum"));
    tx.attach(&n).unwrap();
    tx.set_savepoint().unwrap();
    let p = tx.get_object(id).unwrap();
    tx.set(&p, "price", 11i64).unwrap();
    tx.add(&p, "tags", "red").unwrap();
    let mut buf = Vec::new();
    tx.export_changes(&mut buf).unwrap();
    tx.rollback().unwrap();

    // "tags" is not a list here, so the second change cannot be applied
    let tx2 = session.open_transaction(BranchId::MAIN).unwrap();
    let p2 = tx2.get_object(id).unwrap();
    tx2.set(&p2, "tags", 1i64).unwrap();
    match tx2.import_changes(&mut &buf[..], true) {
        Err(Error::Delta(_)) => {}
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("import succeeded"),
    }

    assert_eq!(tx2.savepoint_count(), 1);
    assert!(tx2.new_objects().is_empty());
    assert_eq!(p2.state(), ObjectState::Dirty);
    assert_eq!(tx2.read(&p2, &feature("price")).unwrap(), Some(Value::Int(10)));
    assert_eq!(tx2.read(&p2, &feature("tags")).unwrap(), Some(Value::Int(1)));
    let deltas = tx2.revision_deltas();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].deltas().len(), 1);

    let info = tx2.commit().unwrap().unwrap();
    assert!(info.new_objects.is_empty());
    assert_eq!(info.dirty_objects, vec![id]);
}

#[test]
fn branches_and_history() {
    let store = open_store();
    let session = open_session(&store);
    let id = create_product(&session, "apple", 10);
    let created = store.last_commit_time();
    let dev = store.create_branch("dev", BranchId::MAIN.point(created)).unwrap();

    let tx = session.open_transaction(dev).unwrap();
    let p = tx.get_object(id).unwrap();
    assert_eq!(tx.read(&p, &feature("price")).unwrap(), Some(Value::Int(10)));
    tx.set(&p, "price", 20i64).unwrap();
    tx.commit().unwrap().unwrap();

    let main_tx = session.open_transaction(BranchId::MAIN).unwrap();
    let q = main_tx.get_object(id).unwrap();
    main_tx.set(&q, "price", 30i64).unwrap();
    main_tx.commit().unwrap().unwrap();

    let reader = open_session(&store);
    let on_main = reader.open_view(BranchId::MAIN.head()).unwrap();
    let on_dev = reader.open_view(dev.head()).unwrap();
    let before = reader.open_view(BranchId::MAIN.point(created)).unwrap();
    assert!(before.is_historical());
    assert!(!on_dev.is_historical());

    let price = feature("price");
    let obj = on_main.get_object(id).unwrap();
    assert_eq!(on_main.read(&obj, &price).unwrap(), Some(Value::Int(30)));
    let obj = on_dev.get_object(id).unwrap();
    assert_eq!(on_dev.read(&obj, &price).unwrap(), Some(Value::Int(20)));
    let obj = before.get_object(id).unwrap();
    assert_eq!(before.read(&obj, &price).unwrap(), Some(Value::Int(10)));

    assert!(reader.open_view(BranchId(42).head()).is_err());
    assert!(reader.open_transaction(BranchId(42)).is_err());
}

#[test]
fn background_invalidation_listener() {
    let store = open_store();
    let writer = open_session(&store);
    let reader = open_session(&store);
    let handle = reader.spawn_invalidation_listener().unwrap();
    assert!(reader.spawn_invalidation_listener().is_err());

    create_product(&writer, "apple", 10);
    let expected = store.last_commit_time();
    let mut waited = 0;
    while reader.last_update_time() < expected && waited < 200 {
        thread::sleep(Duration::from_millis(10));
        waited += 1;
    }
    assert_eq!(reader.last_update_time(), expected);

    reader.close();
    handle.join().unwrap();
}
