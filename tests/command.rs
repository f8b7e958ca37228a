extern crate bhyve_vm;

use std::path::{Path, PathBuf};

use bhyve_vm::boot::*;
use bhyve_vm::command::*;
use bhyve_vm::config::ClientConfiguration;
use bhyve_vm::console::{compile_console, console_candidates, nmdm_paths};
use bhyve_vm::device::{DeviceKind, Lpc};
use bhyve_vm::error::Error;
use bhyve_vm::flags::{Flag, FlagOverrides};
use bhyve_vm::grub::compile_grub;
use bhyve_vm::registry::{add_device, DeviceAddition};
use bhyve_vm::slot::DeviceSlot;
use bhyve_vm::topology::{CpuPin, CpuTopology, Memory};
use bhyve_vm::tty::TtyBackend;
use bhyve_vm::vm::{MachineDefinition, VirtualMachine};
use uuid::Uuid;

const ID: &str = "2a4c1b3e-8d5f-4a6b-9c7d-0e1f2a3b4c5d";

fn slot(text: &str) -> DeviceSlot {
    text.parse().expect("failed to parse slot")
}

fn add(vm: &VirtualMachine, at: &str, kind: DeviceKind) -> VirtualMachine {
    add_device(vm, DeviceAddition::new(kind).at(slot(at)))
        .expect("failed to add device")
        .0
}

fn lpc(ttys: &[&str]) -> DeviceKind {
    let backends = ttys.iter().map(|t| t.parse::<TtyBackend>().expect("failed to parse tty"));
    DeviceKind::Lpc {
        lpc: Lpc::new(backends).expect("failed to build LPC"),
    }
}

/// Two vCPUs, 1152M, a disk, a tap interface and an nmdm console.
fn machine() -> VirtualMachine {
    let definition = MachineDefinition {
        id: Some(Uuid::parse_str(ID).expect("valid uuid")),
        cpu: CpuTopology::with_cpu_count(2).expect("failed to build topology"),
        memory: Memory::new(1, 128).expect("failed to size memory"),
        ..MachineDefinition::named("web")
    };
    let vm = VirtualMachine::define(definition).expect("failed to define machine");
    let vm = add(
        &vm,
        "0:1:0",
        DeviceKind::AhciDisk {
            backend: "file;/tmp/xyz".parse().expect("failed to parse backend"),
        },
    );
    let vm = add(
        &vm,
        "0:2:0",
        DeviceKind::VirtioNetwork {
            backend: "tap;tap0;58:9c:fc:00:00:01;58:9c:fc:00:00:02"
                .parse()
                .expect("failed to parse backend"),
        },
    );
    add(&vm, "0:31:0", lpc(&["nmdm;com1"]))
}

fn openbsd(vm: &VirtualMachine) -> VirtualMachine {
    let boot = BootConfiguration::GrubBhyve {
        name: "install".into(),
        comment: String::new(),
        kernel: KernelInstructions::OpenBsd {
            kernel_path: "/bsd.rd".into(),
            boot_device: slot("0:1:0"),
        },
        disks: vec![DiskAttachment { slot: slot("0:1:0") }],
    };
    merge_boot_configurations(vm, vec![boot], false).expect("failed to merge")
}

fn uefi(vm: &VirtualMachine) -> VirtualMachine {
    let boot = BootConfiguration::Uefi {
        name: "uefi".into(),
        comment: String::new(),
        firmware: "/usr/local/share/uefi-firmware/BHYVE_UEFI.fd".into(),
        disks: vec![DiskAttachment { slot: slot("0:1:0") }],
    };
    merge_boot_configurations(vm, vec![boot], false).expect("failed to merge")
}

#[test]
fn test_bhyve_arguments_in_slot_order() {
    let config = ClientConfiguration::default();
    let vm = openbsd(&machine());
    let boot = vm.boot_configuration("install").expect("configuration present");
    let plan = compile_run(&config, &vm, boot).expect("failed to compile");

    assert_eq!(plan.bhyve.executable(), Path::new("/usr/sbin/bhyve"));
    let expected = vec![
        "-c".to_string(),
        "cpus=2,sockets=1,cores=2,threads=1".into(),
        "-m".into(),
        "1152M".into(),
        "-H".into(),
        "-A".into(),
        "-s".into(),
        "0:0:0,hostbridge".into(),
        "-s".into(),
        "0:1:0,ahci-hd,/tmp/xyz".into(),
        "-s".into(),
        "0:2:0,virtio-net,tap0,mac=58:9c:fc:00:00:02".into(),
        "-s".into(),
        "0:31:0,lpc".into(),
        "-l".into(),
        format!("com1,/dev/nmdm_{}_A", ID),
        "-U".into(),
        ID.into(),
        ID.into(),
    ];
    assert_eq!(plan.bhyve.arguments(), expected.as_slice());
}

#[test]
fn test_flags_and_pins_contribute_switches() {
    let definition = MachineDefinition {
        cpu: CpuTopology::with_cpu_count(2)
            .and_then(|t| {
                t.with_pins(vec![CpuPin {
                    host_cpu: 6,
                    guest_cpu: 1,
                }])
            })
            .expect("failed to pin"),
        flags: FlagOverrides::new()
            .set(Flag::YieldCpuOnHlt, false)
            .set(Flag::WireGuestMemory, true),
        ..MachineDefinition::named("pinned")
    };
    let vm = VirtualMachine::define(definition).expect("failed to define");
    let vm = add(
        &vm,
        "0:1:0",
        DeviceKind::VirtioBlock {
            backend: "file;/tmp/disk".parse().expect("failed to parse backend"),
        },
    );
    let vm = add(&vm, "0:31:0", lpc(&["stdio;com1"]));
    let vm = uefi(&vm);
    let boot = vm.boot_configuration("uefi").expect("configuration present");
    let arguments = bhyve_arguments(&ClientConfiguration::default(), &vm, boot).expect("compile");

    assert!(arguments.contains(&"-A".to_string()));
    assert!(arguments.contains(&"-S".to_string()));
    assert!(!arguments.contains(&"-H".to_string()));
    let pin = arguments.iter().position(|a| a == "-p").expect("pin present");
    assert_eq!(arguments[pin + 1], "1:6");
}

#[test]
fn test_uefi_appends_bootrom() {
    let vm = uefi(&machine());
    let boot = vm.boot_configuration("uefi").expect("configuration present");
    let plan = compile_run(&ClientConfiguration::default(), &vm, boot).expect("failed to compile");
    assert!(plan.loader.is_none());

    let arguments = plan.bhyve.arguments();
    let bootrom = arguments
        .iter()
        .position(|a| a == "bootrom,/usr/local/share/uefi-firmware/BHYVE_UEFI.fd")
        .expect("bootrom present");
    assert_eq!(arguments[bootrom - 1], "-l");
    assert_eq!(arguments[bootrom + 1], "-U");
}

#[test]
fn test_uefi_requires_lpc() {
    let definition = MachineDefinition::named("no-lpc");
    let vm = VirtualMachine::define(definition).expect("failed to define");
    let vm = add(
        &vm,
        "0:1:0",
        DeviceKind::AhciDisk {
            backend: "file;/tmp/xyz".parse().expect("failed to parse backend"),
        },
    );
    let vm = uefi(&vm);
    let boot = vm.boot_configuration("uefi").expect("configuration present");
    match compile_run(&ClientConfiguration::default(), &vm, boot) {
        Err(Error::Validation { .. }) => (),
        other => panic!("expected validation failure, got {:?}", other),
    }
}

#[test]
fn test_grub_loader_for_openbsd() {
    let config = ClientConfiguration::default();
    let vm = openbsd(&machine());
    let boot = vm.boot_configuration("install").expect("configuration present");
    let loader = compile_grub(&config, &vm, boot).expect("failed to compile loader");

    let directory = PathBuf::from(format!("/var/run/bhyve-vm/{}/grub", ID));
    assert_eq!(loader.files[0].path, directory.join("device.map"));
    assert_eq!(loader.files[0].contents, "(hd0) /tmp/xyz\n");
    assert_eq!(loader.files[1].path, directory.join("grub.cfg"));
    assert_eq!(loader.files[1].contents, "kopenbsd -h com0 (hd0,openbsd1)/bsd.rd\nboot\n");
    assert_eq!(
        loader.process.to_string(),
        format!(
            "/usr/local/sbin/grub-bhyve -m {0}/device.map -r host -d {0} -M 1152M {1}",
            directory.display(),
            ID
        )
    );
}

#[test]
fn test_grub_loader_for_linux_from_optical_disk() {
    let vm = add(
        &machine(),
        "0:3:0",
        DeviceKind::AhciOpticalDisk {
            backend: "file;/iso/install.iso;ro".parse().expect("failed to parse backend"),
        },
    );
    let boot = BootConfiguration::GrubBhyve {
        name: "linux".into(),
        comment: String::new(),
        kernel: KernelInstructions::Linux {
            kernel_path: "/isolinux/vmlinuz".into(),
            kernel_device: slot("0:3:0"),
            arguments: vec!["console=ttyS0".into(), "quiet".into()],
            initrd_path: "/isolinux/initrd.img".into(),
            initrd_device: slot("0:3:0"),
        },
        disks: vec![
            DiskAttachment { slot: slot("0:1:0") },
            DiskAttachment { slot: slot("0:3:0") },
        ],
    };
    let vm = merge_boot_configurations(&vm, vec![boot], false).expect("failed to merge");
    let boot = vm.boot_configuration("linux").expect("configuration present");
    let loader = compile_grub(&ClientConfiguration::default(), &vm, boot).expect("compile");

    assert_eq!(loader.files[0].contents, "(hd0) /tmp/xyz\n(cd0) /iso/install.iso\n");
    assert_eq!(
        loader.files[1].contents,
        "linux (cd0)/isolinux/vmlinuz console=ttyS0 quiet\ninitrd (cd0)/isolinux/initrd.img\nboot\n"
    );
}

fn linux_with_arguments(arguments: &[&str]) -> VirtualMachine {
    let boot = BootConfiguration::GrubBhyve {
        name: "linux".into(),
        comment: String::new(),
        kernel: KernelInstructions::Linux {
            kernel_path: "/boot/vmlinuz".into(),
            kernel_device: slot("0:1:0"),
            arguments: arguments.iter().map(|a| a.to_string()).collect(),
            initrd_path: "/boot/initrd.img".into(),
            initrd_device: slot("0:1:0"),
        },
        disks: vec![DiskAttachment { slot: slot("0:1:0") }],
    };
    merge_boot_configurations(&machine(), vec![boot], false).expect("failed to merge")
}

#[test]
fn test_grub_quotes_kernel_arguments() {
    let vm = linux_with_arguments(&["console=ttyS0", "root=$root;reboot", "it's", ""]);
    let boot = vm.boot_configuration("linux").expect("configuration present");
    let loader = compile_grub(&ClientConfiguration::default(), &vm, boot).expect("compile");
    assert_eq!(
        loader.files[1].contents,
        "linux (hd0,msdos1)/boot/vmlinuz console=ttyS0 'root=$root;reboot' 'it'\\''s' ''\n\
         initrd (hd0,msdos1)/boot/initrd.img\nboot\n"
    );
}

#[test]
fn test_grub_rejects_multiline_kernel_argument() {
    let vm = linux_with_arguments(&["quiet\nboot"]);
    let boot = vm.boot_configuration("linux").expect("configuration present");
    match compile_grub(&ClientConfiguration::default(), &vm, boot) {
        Err(Error::Validation { .. }) => (),
        other => panic!("expected validation failure, got {:?}", other),
    }
}

#[test]
fn test_grub_rejects_uefi_configuration() {
    let vm = uefi(&machine());
    let boot = vm.boot_configuration("uefi").expect("configuration present");
    assert!(compile_grub(&ClientConfiguration::default(), &vm, boot).is_err());
}

#[test]
fn test_console_attaches_to_host_side_of_nmdm() {
    let vm = machine();
    let console = compile_console(&ClientConfiguration::default(), &vm).expect("single console");
    assert_eq!(
        console.to_string(),
        format!("/usr/bin/cu -l /dev/nmdm_{}_B", ID)
    );
    assert_eq!(nmdm_paths(&vm.id()).host, PathBuf::from(format!("/dev/nmdm_{}_B", ID)));
}

#[test]
fn test_no_single_console() {
    let definition = MachineDefinition::named("headless");
    let vm = VirtualMachine::define(definition).expect("failed to define");
    assert!(compile_console(&ClientConfiguration::default(), &vm).is_none());

    let vm = add(&vm, "0:31:0", lpc(&["nmdm;com1", "stdio;com2"]));
    assert_eq!(console_candidates(&vm).len(), 2);
    assert!(compile_console(&ClientConfiguration::default(), &vm).is_none());
}

#[test]
fn test_kill_destroys_by_uuid() {
    let kill = compile_kill(&ClientConfiguration::default(), &machine());
    assert_eq!(
        kill.to_string(),
        format!("/usr/sbin/bhyvectl --vm={} --destroy", ID)
    );
}

#[test]
fn test_zfs_volume_path_in_arguments() {
    let vm = add(
        &machine(),
        "0:4:0",
        DeviceKind::VirtioBlock {
            backend: "zfs-volume;1073741824".parse().expect("failed to parse backend"),
        },
    );
    let vm = openbsd(&vm);
    let boot = vm.boot_configuration("install").expect("configuration present");
    let arguments = bhyve_arguments(&ClientConfiguration::default(), &vm, boot).expect("compile");
    assert!(arguments.contains(&format!("0:4:0,virtio-blk,/storage/vm/{}/disk-4", ID)));
}
