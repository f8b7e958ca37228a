extern crate bhyve_vm;

use std::fs;

use bhyve_vm::device::DeviceKind;
use bhyve_vm::error::Error;
use bhyve_vm::registry::{add_device, DeviceAddition};
use bhyve_vm::store::MachineStore;
use bhyve_vm::vm::{MachineDefinition, VirtualMachine};
use vmm_sys_util::tempdir::TempDir;

fn scratch() -> TempDir {
    TempDir::new_with_prefix(std::env::temp_dir().join("bhyve-vm-store-"))
        .expect("failed to create scratch directory")
}

fn machine(name: &str) -> VirtualMachine {
    VirtualMachine::define(MachineDefinition::named(name)).expect("failed to define machine")
}

#[test]
fn test_put_then_get() {
    let directory = scratch();
    let store = MachineStore::open(directory.as_path()).expect("failed to open store");
    let (vm, _) = add_device(
        &machine("web"),
        DeviceAddition::new(DeviceKind::AhciDisk {
            backend: "file;/tmp/xyz;ro".parse().expect("failed to parse backend"),
        }),
    )
    .expect("failed to add disk");

    let stored = store.insert(&vm).expect("failed to insert");
    assert_eq!(stored.source(), Some(store.record_path(&vm.id()).as_path()));

    let loaded = store.get(&vm.id()).expect("failed to get");
    assert_eq!(loaded, stored);
    assert_eq!(loaded.devices().count(), 2);
}

#[test]
fn test_put_leaves_no_temporary_files() {
    let directory = scratch();
    let store = MachineStore::open(directory.as_path()).expect("failed to open store");
    let vm = machine("web");
    store.put(&vm).expect("first write");
    store.put(&vm).expect("second write");

    let names: Vec<String> = fs::read_dir(directory.as_path())
        .expect("failed to read directory")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec![format!("{}.json", vm.id())]);
}

#[test]
fn test_list_orders_by_name_and_skips_foreign_files() {
    let directory = scratch();
    let store = MachineStore::open(directory.as_path()).expect("failed to open store");
    store.insert(&machine("zulu")).expect("insert zulu");
    store.insert(&machine("alpha")).expect("insert alpha");
    fs::write(directory.as_path().join("notes.txt"), b"scratch").expect("write foreign file");
    fs::write(directory.as_path().join("not-a-uuid.json"), b"{}").expect("write foreign file");

    let names: Vec<String> = store
        .list()
        .expect("failed to list")
        .iter()
        .map(|m| m.name().to_string())
        .collect();
    assert_eq!(names, vec!["alpha", "zulu"]);
}

#[test]
fn test_find_by_name_or_uuid() {
    let directory = scratch();
    let store = MachineStore::open(directory.as_path()).expect("failed to open store");
    let vm = store.insert(&machine("db")).expect("failed to insert");

    assert_eq!(store.find("db").expect("by name").id(), vm.id());
    assert_eq!(store.find(&vm.id().to_string()).expect("by uuid").id(), vm.id());
    match store.find("web") {
        Err(Error::Nonexistent { kind, .. }) => assert_eq!(kind, "machine"),
        other => panic!("expected nonexistent, got {:?}", other),
    }
}

#[test]
fn test_insert_rejects_duplicate_name() {
    let directory = scratch();
    let store = MachineStore::open(directory.as_path()).expect("failed to open store");
    store.insert(&machine("db")).expect("failed to insert");
    match store.insert(&machine("db")) {
        Err(Error::Duplicate { .. }) => (),
        other => panic!("expected duplicate, got {:?}", other),
    }
}

#[test]
fn test_delete() {
    let directory = scratch();
    let store = MachineStore::open(directory.as_path()).expect("failed to open store");
    let vm = store.insert(&machine("db")).expect("failed to insert");
    store.delete(&vm.id()).expect("failed to delete");
    assert!(!store.exists(&vm.id()));
    assert!(store.delete(&vm.id()).is_err());
}

#[test]
fn test_export_import_between_stores() {
    let (first, second) = (scratch(), scratch());
    let source = MachineStore::open(first.as_path()).expect("failed to open store");
    let destination = MachineStore::open(second.as_path()).expect("failed to open store");
    let vm = source.insert(&machine("portable")).expect("failed to insert");

    let bytes = source.export(&vm.id()).expect("failed to export");
    let imported = destination.import(&bytes, false).expect("failed to import");
    assert_eq!(imported.id(), vm.id());
    assert_eq!(imported.name(), "portable");

    assert!(destination.import(&bytes, false).is_err());
    destination.import(&bytes, true).expect("failed to replace");
}

#[test]
fn test_replacing_import_keeps_names_unique() {
    let (first, second) = (scratch(), scratch());
    let source = MachineStore::open(first.as_path()).expect("failed to open store");
    let destination = MachineStore::open(second.as_path()).expect("failed to open store");
    let incoming = source.insert(&machine("web")).expect("failed to insert");
    let resident = destination.insert(&machine("web")).expect("failed to insert");
    assert_ne!(incoming.id(), resident.id());

    let bytes = source.export(&incoming.id()).expect("failed to export");
    match destination.import(&bytes, true) {
        Err(Error::Duplicate { kind, name }) => {
            assert_eq!(kind, "machine name");
            assert_eq!(name, "web");
        }
        other => panic!("expected duplicate, got {:?}", other),
    }
    assert!(!destination.exists(&incoming.id()));
    assert_eq!(destination.list().expect("failed to list").len(), 1);
}

#[test]
fn test_record_for_other_machine_rejected() {
    let directory = scratch();
    let store = MachineStore::open(directory.as_path()).expect("failed to open store");
    let a = store.insert(&machine("a")).expect("insert a");
    let b = store.insert(&machine("b")).expect("insert b");
    fs::copy(store.record_path(&a.id()), store.record_path(&b.id())).expect("copy record");

    match store.get(&b.id()) {
        Err(Error::Codec { .. }) => (),
        other => panic!("expected codec failure, got {:?}", other),
    }
}
