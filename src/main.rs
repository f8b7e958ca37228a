// Copyright (C) 2020, Oxide Computer Company

//! Command-line interface.
//!
//! Every mutating command reads a machine record, derives a new machine
//! from it, and writes that back whole.

use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::warn;

use bhyve_vm::boot::{
    merge_boot_configurations, remove_boot_configurations, BootConfiguration, DiskAttachment,
    KernelInstructions,
};
use bhyve_vm::command::{compile_kill, compile_run};
use bhyve_vm::config::ClientConfiguration;
use bhyve_vm::console::{compile_console, console_candidates};
use bhyve_vm::device::{
    DeviceKind, Framebuffer, HostBridgeVendor, HostPciAddress, Lpc, VgaMode,
};
use bhyve_vm::error::Error;
use bhyve_vm::flags::{FlagOverrides, Flags};
use bhyve_vm::network::NetworkBackend;
use bhyve_vm::realize::Realizer;
use bhyve_vm::registry::{add_device, delete_devices, DeviceAddition};
use bhyve_vm::slot::DeviceSlot;
use bhyve_vm::storage::{HostStorage, StorageBackend};
use bhyve_vm::store::MachineStore;
use bhyve_vm::system::{HostSystem, ProcessExecutor};
use bhyve_vm::topology::{CpuPin, CpuTopology, Memory};
use bhyve_vm::tty::TtyBackend;
use bhyve_vm::vm::{MachineDefinition, MachineDelta, VirtualMachine};

const DEFAULT_CONFIGURATION: &str = "/usr/local/etc/bhyve-vm.toml";

#[derive(Parser, Debug)]
#[command(name = "bhyve-vm")]
#[command(about = "Define, provision and run bhyve virtual machines")]
#[command(version)]
struct Cli {
    /// Increase logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Client configuration file
    #[arg(long, env = "BHYVE_VM_CONFIGURATION", default_value = DEFAULT_CONFIGURATION, global = true)]
    configuration: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct TopologyArgs {
    /// Number of vCPUs, as one socket of single-threaded cores
    #[arg(long, conflicts_with_all = ["sockets", "cores", "threads"])]
    cpu_count: Option<u32>,

    #[arg(long)]
    sockets: Option<u32>,

    #[arg(long)]
    cores: Option<u32>,

    #[arg(long)]
    threads: Option<u32>,

    /// Pin a guest vCPU to a host CPU, as <host>:<guest>
    #[arg(long = "pin")]
    pins: Vec<String>,
}

#[derive(Args, Debug)]
struct MemoryArgs {
    #[arg(long)]
    memory_gigabytes: Option<u64>,

    #[arg(long)]
    memory_megabytes: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Define a new machine
    Define {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        comment: String,

        #[command(flatten)]
        topology: TopologyArgs,

        #[command(flatten)]
        memory: MemoryArgs,

        /// Set a flag, as <name>=<true|false>
        #[arg(long = "flag")]
        flags: Vec<String>,
    },

    /// List defined machines
    List,

    /// Show a machine
    Show { machine: String },

    /// Delete a machine record
    Delete { machine: String },

    /// Change a machine's name, comment, topology, memory or flags
    Modify {
        machine: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        comment: Option<String>,

        #[command(flatten)]
        topology: TopologyArgs,

        #[command(flatten)]
        memory: MemoryArgs,

        #[arg(long = "flag")]
        flags: Vec<String>,
    },

    /// Add a device
    DeviceAdd(DeviceAddArgs),

    /// Delete devices
    DeviceDelete {
        machine: String,

        #[arg(required = true)]
        slots: Vec<DeviceSlot>,
    },

    /// Add or update a UEFI boot configuration
    BootAddUefi {
        machine: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        firmware: PathBuf,

        #[command(flatten)]
        common: BootArgs,
    },

    /// Add or update a grub-bhyve boot configuration for an OpenBSD kernel
    BootAddOpenbsd {
        machine: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        kernel: PathBuf,

        #[arg(long)]
        boot_device: DeviceSlot,

        #[command(flatten)]
        common: BootArgs,
    },

    /// Add or update a grub-bhyve boot configuration for a Linux kernel
    BootAddLinux {
        machine: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        kernel: PathBuf,

        #[arg(long)]
        kernel_device: DeviceSlot,

        /// Kernel command-line argument (repeatable)
        #[arg(long = "argument", allow_hyphen_values = true)]
        arguments: Vec<String>,

        #[arg(long)]
        initrd: PathBuf,

        #[arg(long)]
        initrd_device: DeviceSlot,

        #[command(flatten)]
        common: BootArgs,
    },

    /// Delete boot configurations
    BootDelete {
        machine: String,

        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Create missing storage and network interfaces
    Realize {
        machine: String,

        #[arg(long)]
        dry_run: bool,
    },

    /// Boot a machine, replacing this process with bhyve
    Run {
        machine: String,

        /// Boot configuration name
        #[arg(long)]
        boot: String,

        #[arg(long)]
        dry_run: bool,
    },

    /// Attach to a machine's console
    Console {
        machine: String,

        #[arg(long)]
        dry_run: bool,
    },

    /// Destroy a running machine
    Kill {
        machine: String,

        #[arg(long)]
        dry_run: bool,
    },

    /// Write a machine record to a file or standard output
    Export {
        machine: String,

        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Read a machine record exported elsewhere
    Import {
        file: PathBuf,

        /// Overwrite a machine with the same UUID
        #[arg(long)]
        replace: bool,
    },
}

#[derive(Args, Debug)]
struct BootArgs {
    /// Attach a storage device to the loader (repeatable)
    #[arg(long = "disk")]
    disks: Vec<DeviceSlot>,

    #[arg(long, default_value = "")]
    comment: String,

    /// Replace an existing configuration of the same name
    #[arg(long)]
    update: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    HostBridge,
    VirtioNetwork,
    VirtioBlock,
    AhciDisk,
    AhciOpticalDisk,
    Lpc,
    Passthru,
    Framebuffer,
    XhciUsbTablet,
    E1000Network,
}

#[derive(Args, Debug)]
struct DeviceAddArgs {
    machine: String,

    #[arg(long, value_enum)]
    kind: KindArg,

    /// Slot as bus:slot:function; the first free bus 0 slot if omitted
    #[arg(long)]
    slot: Option<DeviceSlot>,

    /// Overwrite a device already at --slot
    #[arg(long, requires = "slot")]
    replace: bool,

    #[arg(long, default_value = "")]
    comment: String,

    /// Storage or network backend, e.g. file;/vm/disk.img or tap;tap0;<host-mac>;<guest-mac>
    #[arg(long)]
    backend: Option<String>,

    /// LPC serial endpoint, e.g. nmdm;com1 (repeatable)
    #[arg(long = "tty")]
    ttys: Vec<TtyBackend>,

    /// Host PCI address for passthru, as bus/slot/function
    #[arg(long)]
    host_slot: Option<HostPciAddress>,

    #[arg(long, default_value = "default")]
    vendor: HostBridgeVendor,

    #[arg(long, default_value_t = 1024)]
    width: u32,

    #[arg(long, default_value_t = 768)]
    height: u32,

    #[arg(long, default_value = "127.0.0.1")]
    listen: IpAddr,

    #[arg(long, default_value_t = 5900)]
    port: u16,

    #[arg(long, default_value = "io")]
    vga: VgaMode,

    /// Hold the guest until a VNC client connects
    #[arg(long)]
    wait: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("bhyve-vm: {:#}", e);
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config = ClientConfiguration::load(&cli.configuration)
        .with_context(|| format!("loading {}", cli.configuration.display()))?;
    let store = MachineStore::open(&config.machine_directory)?;

    match cli.command {
        Commands::Define {
            name,
            comment,
            topology,
            memory,
            flags,
        } => {
            let cpu = parse_topology(&topology)?.unwrap_or_default();
            let definition = MachineDefinition {
                id: None,
                name,
                comment,
                cpu,
                memory: Memory::new(
                    memory.memory_gigabytes.unwrap_or(0),
                    memory.memory_megabytes.unwrap_or(0),
                )?,
                flags: FlagOverrides::parse(flags.iter().map(String::as_str))?,
            };
            let machine = store.insert(&VirtualMachine::define(definition)?)?;
            println!("{}", machine.id());
        }

        Commands::List => {
            for machine in store.list()? {
                println!("{}  {}", machine.id(), machine.name());
            }
        }

        Commands::Show { machine } => show(&store.find(&machine)?),

        Commands::Delete { machine } => {
            let machine = store.find(&machine)?;
            store.delete(&machine.id())?;
        }

        Commands::Modify {
            machine,
            name,
            comment,
            topology,
            memory,
            flags,
        } => {
            let machine = store.find(&machine)?;
            let memory = match (memory.memory_gigabytes, memory.memory_megabytes) {
                (None, None) => None,
                (gigabytes, megabytes) => Some(Memory::new(
                    gigabytes.unwrap_or(machine.memory().gigabytes()),
                    megabytes.unwrap_or(machine.memory().megabytes()),
                )?),
            };
            let delta = MachineDelta {
                name,
                comment,
                cpu: parse_topology(&topology)?,
                memory,
                flags: FlagOverrides::parse(flags.iter().map(String::as_str))?,
            };
            store.put(&machine.apply(&delta)?)?;
        }

        Commands::DeviceAdd(args) => {
            let machine = store.find(&args.machine)?;
            let kind = device_kind(&args)?;
            let mut addition = DeviceAddition::new(kind).with_comment(args.comment.clone());
            if let Some(slot) = args.slot {
                addition = addition.at(slot);
            }
            if args.replace {
                addition = addition.replacing();
            }
            let (machine, slot) = add_device(&machine, addition)?;
            store.put(&machine)?;
            println!("{}", slot);
        }

        Commands::DeviceDelete { machine, slots } => {
            let machine = store.find(&machine)?;
            store.put(&delete_devices(&machine, &slots)?)?;
        }

        Commands::BootAddUefi {
            machine,
            name,
            firmware,
            common,
        } => {
            let configuration = BootConfiguration::Uefi {
                name,
                comment: common.comment,
                firmware,
                disks: attachments(&common.disks),
            };
            merge(&store, &machine, configuration, common.update)?;
        }

        Commands::BootAddOpenbsd {
            machine,
            name,
            kernel,
            boot_device,
            common,
        } => {
            let configuration = BootConfiguration::GrubBhyve {
                name,
                comment: common.comment,
                kernel: KernelInstructions::OpenBsd {
                    kernel_path: kernel,
                    boot_device,
                },
                disks: attachments(&common.disks),
            };
            merge(&store, &machine, configuration, common.update)?;
        }

        Commands::BootAddLinux {
            machine,
            name,
            kernel,
            kernel_device,
            arguments,
            initrd,
            initrd_device,
            common,
        } => {
            let configuration = BootConfiguration::GrubBhyve {
                name,
                comment: common.comment,
                kernel: KernelInstructions::Linux {
                    kernel_path: kernel,
                    kernel_device,
                    arguments,
                    initrd_path: initrd,
                    initrd_device,
                },
                disks: attachments(&common.disks),
            };
            merge(&store, &machine, configuration, common.update)?;
        }

        Commands::BootDelete { machine, names } => {
            let machine = store.find(&machine)?;
            store.put(&remove_boot_configurations(&machine, &names)?)?;
        }

        Commands::Realize { machine, dry_run } => {
            let machine = store.find(&machine)?;
            warn_unprivileged(dry_run);
            realize(&config, &machine, dry_run)?;
        }

        Commands::Run {
            machine,
            boot,
            dry_run,
        } => {
            let machine = store.find(&machine)?;
            let boot = machine
                .boot_configuration(&boot)
                .ok_or_else(|| Error::nonexistent("boot configuration", boot.as_str()))?;
            let plan = compile_run(&config, &machine, boot)?;

            if dry_run {
                realize(&config, &machine, true)?;
                if let Some(loader) = &plan.loader {
                    for file in &loader.files {
                        println!("# {}", file.path.display());
                        print!("{}", file.contents);
                    }
                    println!("{}", loader.process);
                }
                println!("{}", plan.bhyve);
                return Ok(0);
            }

            warn_unprivileged(false);
            realize(&config, &machine, false)?;
            if let Some(loader) = &plan.loader {
                for file in &loader.files {
                    if let Some(directory) = file.path.parent() {
                        fs::create_dir_all(directory)
                            .with_context(|| format!("creating {}", directory.display()))?;
                    }
                    fs::write(&file.path, &file.contents)
                        .with_context(|| format!("writing {}", file.path.display()))?;
                }
                let status = HostSystem.spawn_and_wait(&loader.process)?;
                if status != 0 {
                    return Err(Error::ProcessFailure {
                        executable: loader.process.executable().display().to_string(),
                        reason: format!("exited with status {}", status),
                    }
                    .into());
                }
            }
            return Err(HostSystem.replace_current_process(&plan.bhyve).into());
        }

        Commands::Console { machine, dry_run } => {
            let machine = store.find(&machine)?;
            let console = compile_console(&config, &machine).ok_or_else(|| Error::NoSingleConsole {
                candidates: console_candidates(&machine).len(),
            })?;
            if dry_run {
                println!("{}", console);
                return Ok(0);
            }
            return Err(HostSystem.replace_current_process(&console).into());
        }

        Commands::Kill { machine, dry_run } => {
            let machine = store.find(&machine)?;
            let kill = compile_kill(&config, &machine);
            if dry_run {
                println!("{}", kill);
                return Ok(0);
            }
            warn_unprivileged(false);
            let status = HostSystem.spawn_and_wait(&kill)?;
            if status != 0 {
                eprintln!("{} exited with status {}", kill.executable().display(), status);
            }
            return Ok(status);
        }

        Commands::Export { machine, output } => {
            let machine = store.find(&machine)?;
            let bytes = store.export(&machine.id())?;
            match output {
                Some(path) => fs::write(&path, bytes)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => io::stdout().write_all(&bytes)?,
            }
        }

        Commands::Import { file, replace } => {
            let bytes = fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let machine = store.import(&bytes, replace)?;
            println!("{}", machine.id());
        }
    }
    Ok(0)
}

fn merge(
    store: &MachineStore,
    key: &str,
    configuration: BootConfiguration,
    update: bool,
) -> Result<()> {
    let machine = store.find(key)?;
    store.put(&merge_boot_configurations(&machine, vec![configuration], update)?)?;
    Ok(())
}

fn realize(config: &ClientConfiguration, machine: &VirtualMachine, dry_run: bool) -> Result<()> {
    let storage = HostStorage::new(&config.zfs, &HostSystem);
    let realizer = Realizer::new(config, &storage, &HostSystem);
    for step in realizer.realize(machine, dry_run)? {
        println!("{}", step);
    }
    Ok(())
}

fn warn_unprivileged(dry_run: bool) {
    if !dry_run && !HostSystem::is_privileged() {
        warn!("not running as root; bhyve, bhyvectl and ifconfig are likely to fail");
    }
}

fn attachments(slots: &[DeviceSlot]) -> Vec<DiskAttachment> {
    slots.iter().map(|slot| DiskAttachment { slot: *slot }).collect()
}

fn parse_topology(args: &TopologyArgs) -> Result<Option<CpuTopology>> {
    let topology = match args.cpu_count {
        Some(count) => Some(CpuTopology::with_cpu_count(count)?),
        None if args.sockets.is_some() || args.cores.is_some() || args.threads.is_some() => {
            Some(CpuTopology::new(
                args.sockets.unwrap_or(1),
                args.cores.unwrap_or(1),
                args.threads.unwrap_or(1),
                None,
            )?)
        }
        None => None,
    };

    if args.pins.is_empty() {
        return Ok(topology);
    }
    let topology = match topology {
        Some(topology) => topology,
        None => bail!("--pin requires --cpu-count or --sockets/--cores/--threads"),
    };
    let mut pins = Vec::new();
    for pin in &args.pins {
        let (host, guest) = match pin.split_once(':') {
            Some(parts) => parts,
            None => bail!("pin '{}' must have the form <host>:<guest>", pin),
        };
        pins.push(CpuPin {
            host_cpu: host.parse().with_context(|| format!("host cpu in '{}'", pin))?,
            guest_cpu: guest.parse().with_context(|| format!("guest cpu in '{}'", pin))?,
        });
    }
    Ok(Some(topology.with_pins(pins)?))
}

fn backend(args: &DeviceAddArgs) -> Result<&str> {
    match &args.backend {
        Some(backend) => Ok(backend.as_str()),
        None => bail!("--kind {:?} requires --backend", args.kind),
    }
}

fn storage(args: &DeviceAddArgs) -> Result<StorageBackend> {
    Ok(backend(args)?.parse()?)
}

fn network(args: &DeviceAddArgs) -> Result<NetworkBackend> {
    Ok(backend(args)?.parse()?)
}

fn device_kind(args: &DeviceAddArgs) -> Result<DeviceKind> {
    let kind = match args.kind {
        KindArg::HostBridge => DeviceKind::HostBridge {
            vendor: args.vendor,
        },
        KindArg::VirtioNetwork => DeviceKind::VirtioNetwork {
            backend: network(args)?,
        },
        KindArg::E1000Network => DeviceKind::E1000Network {
            backend: network(args)?,
        },
        KindArg::VirtioBlock => DeviceKind::VirtioBlock {
            backend: storage(args)?,
        },
        KindArg::AhciDisk => DeviceKind::AhciDisk {
            backend: storage(args)?,
        },
        KindArg::AhciOpticalDisk => DeviceKind::AhciOpticalDisk {
            backend: storage(args)?,
        },
        KindArg::Lpc => DeviceKind::Lpc {
            lpc: Lpc::new(args.ttys.iter().cloned())?,
        },
        KindArg::Passthru => match args.host_slot {
            Some(host_slot) => DeviceKind::Passthru { host_slot },
            None => bail!("--kind passthru requires --host-slot"),
        },
        KindArg::Framebuffer => DeviceKind::Framebuffer {
            framebuffer: Framebuffer {
                width: args.width,
                height: args.height,
                listen_address: args.listen,
                listen_port: args.port,
                vga_mode: args.vga,
                wait_for_vnc: args.wait,
            },
        },
        KindArg::XhciUsbTablet => DeviceKind::XhciUsbTablet,
    };
    Ok(kind)
}

fn show(machine: &VirtualMachine) {
    let cpu = machine.cpu();
    println!("id:       {}", machine.id());
    println!("name:     {}", machine.name());
    if !machine.comment().is_empty() {
        println!("comment:  {}", machine.comment());
    }
    println!(
        "cpu:      {} ({} sockets, {} cores, {} threads)",
        cpu.cpus(),
        cpu.sockets(),
        cpu.cores(),
        cpu.threads()
    );
    for pin in cpu.pins() {
        println!("  pin:    host {} -> guest {}", pin.host_cpu, pin.guest_cpu);
    }
    println!("memory:   {}M", machine.memory().total_megabytes());
    println!("flags:    {}", enabled_flags(machine.flags()));
    println!("devices:");
    for device in machine.devices() {
        println!("  {:<8} {}  {}", device.slot.to_string(), device.kind.name(), device.comment);
    }
    println!("boot configurations:");
    for configuration in machine.boot_configurations() {
        let kind = match configuration {
            BootConfiguration::GrubBhyve { .. } => "grub-bhyve",
            BootConfiguration::Uefi { .. } => "uefi",
        };
        println!("  {}  {}", configuration.name(), kind);
    }
}

fn enabled_flags(flags: Flags) -> String {
    bhyve_vm::flags::Flag::ALL
        .iter()
        .filter(|flag| flags.get(**flag))
        .map(|flag| flag.name())
        .collect::<Vec<_>>()
        .join(", ")
}
