//! Command lines for the machine and bridge sessions.
//!
//! Both builders are pure: the same [`HostFacts`] always give the same
//! [`LaunchSpec`]. The machine command line is a compatibility contract with
//! the QEMU binary shipped in the runtime directory, so flag order and
//! spelling are fixed.
//!
//! ```text
//! machine:  qemu ... -chardev socket,server,nowait,id=console<i>,path=<runtime>/.qemu<i>
//!                                                         ▲
//! bridge i: socat /dev/tty,rawer UNIX-CONNECT:<runtime>/.qemu<i>,interval=0.1,forever
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{
    CDROM_IMAGE_NAME, CONSOLE_COUNT, CUSTOM_CDROM_IMAGE_NAME, CUSTOM_HDD_IMAGE_NAME,
    HDD_IMAGE_NAME, HostFacts, LaunchSpec, QEMU_DATA_DIR,
};
use crate::error::{Error, Result};

const MIB: f64 = 1_048_576.0;

/// Share of host memory given to guest RAM.
///
/// Together with [`TCG_SHARE`] this stays at 40 % of the host. Going much
/// past 40–50 % makes the host likely to reclaim the whole supervisor.
pub const RAM_SHARE: f64 = 0.32;

/// Share of host memory given to the TCG translation buffer.
pub const TCG_SHARE: f64 = 0.08;

/// Sizing used when host memory cannot be determined.
pub const FALLBACK_RAM_MIB: u64 = 256;
pub const FALLBACK_TCG_MIB: u64 = 64;

/// Seconds between bridge reconnect attempts.
const BRIDGE_RETRY_INTERVAL: &str = "0.1";

/// 9p mount tag the guest uses for the shared storage.
pub const SHARED_STORAGE_TAG: &str = "shared_storage";

/// Guest memory allocation derived from host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPlan {
    pub ram_mib: u64,
    pub tcg_buffer_mib: u64,
}

impl MemoryPlan {
    pub fn for_host(total_memory_bytes: Option<u64>) -> Self {
        match total_memory_bytes {
            Some(bytes) => Self {
                ram_mib: (bytes as f64 * RAM_SHARE / MIB) as u64,
                tcg_buffer_mib: (bytes as f64 * TCG_SHARE / MIB) as u64,
            },
            None => Self {
                ram_mib: FALLBACK_RAM_MIB,
                tcg_buffer_mib: FALLBACK_TCG_MIB,
            },
        }
    }
}

/// Rendezvous socket between machine console `index` and its bridge.
pub fn console_socket_path(runtime_dir: &Path, index: usize) -> PathBuf {
    runtime_dir.join(format!(".qemu{index}"))
}

/// Small builder so flag/value pairs read like the command line.
#[derive(Default)]
struct Argv(Vec<String>);

impl Argv {
    fn flag(&mut self, flag: &str) -> &mut Self {
        self.0.push(flag.to_string());
        self
    }

    fn opt(&mut self, flag: &str, value: impl Into<String>) -> &mut Self {
        self.0.push(flag.to_string());
        self.0.push(value.into());
        self
    }
}

/// Build the machine session command line and environment.
pub fn build_machine(facts: &HostFacts) -> Result<LaunchSpec> {
    let program = facts.machine_executable.require()?.to_path_buf();
    let runtime = facts.runtime_dir.display().to_string();
    let work_dir = facts.machine_work_dir().to_path_buf();

    let mut a = Argv::default();
    a.flag(&program.display().to_string());

    // Instance name (shown by remote display tooling).
    a.opt("-name", facts.machine_name.as_str());

    // Firmware and keymaps.
    a.opt("-L", format!("{runtime}/{QEMU_DATA_DIR}"));

    a.opt("-cpu", "max");
    a.opt("-smp", "cpus=4,cores=4,threads=1,sockets=1");

    let memory = MemoryPlan::for_host(facts.total_memory_bytes);
    a.opt("-m", format!("{}M", memory.ram_mib));
    a.opt("-accel", format!("tcg,tb-size={}", memory.tcg_buffer_mib));

    a.opt("-device", "virtio-balloon");
    a.flag("-nodefaults");

    // SCSI CD-ROM(s) and HDD(s). Custom images sit in slots 1 and 4.
    let custom_cdrom = facts
        .custom_cdrom_present
        .then(|| work_dir.join(CUSTOM_CDROM_IMAGE_NAME));
    let custom_hdd = facts
        .custom_hdd_present
        .then(|| work_dir.join(CUSTOM_HDD_IMAGE_NAME));

    a.opt(
        "-drive",
        format!("file={runtime}/{CDROM_IMAGE_NAME},if=none,media=cdrom,index=0,id=cd0"),
    );
    if let Some(image) = &custom_cdrom {
        a.opt(
            "-drive",
            format!("file={},if=none,media=cdrom,index=1,id=cd1", image.display()),
        );
    }
    a.opt(
        "-drive",
        format!(
            "file={runtime}/{HDD_IMAGE_NAME},if=none,index=3,discard=unmap,detect-zeroes=unmap,cache=writeback,id=hd0"
        ),
    );
    if let Some(image) = &custom_hdd {
        a.opt(
            "-drive",
            format!(
                "file={},if=none,index=4,discard=unmap,detect-zeroes=unmap,cache=writeback,id=hd1",
                image.display()
            ),
        );
    }
    a.opt("-device", "virtio-scsi-pci,id=virtio-scsi-pci0");
    a.opt("-device", "scsi-cd,bus=virtio-scsi-pci0.0,id=scsi-cd0,drive=cd0");
    if custom_cdrom.is_some() {
        a.opt("-device", "scsi-cd,bus=virtio-scsi-pci0.0,id=scsi-cd1,drive=cd1");
    }
    a.opt("-device", "scsi-hd,bus=virtio-scsi-pci0.0,id=scsi-hd0,drive=hd0");
    if custom_hdd.is_some() {
        a.opt("-device", "scsi-hd,bus=virtio-scsi-pci0.0,id=scsi-hd1,drive=hd1");
    }

    // Boot from HDD, keep the boot menu reachable.
    a.opt("-boot", "c,menu=on");

    a.opt("-object", "rng-random,filename=/dev/urandom,id=rng0");
    a.opt("-device", "virtio-rng-pci,rng=rng0,id=virtio-rng-pci0");

    a.opt("-netdev", "user,id=vmnic0");
    a.opt("-device", "virtio-net-pci,netdev=vmnic0,id=virtio-net-pci0");

    if facts.storage_mounted {
        a.opt(
            "-fsdev",
            format!(
                "local,security_model=none,id=fsdev0,multidevs=remap,path={}",
                facts.storage_root.display()
            ),
        );
        a.opt(
            "-device",
            format!("virtio-9p-pci,fsdev=fsdev0,mount_tag={SHARED_STORAGE_TAG},id=virtio-9p-pci0"),
        );
    }

    // Monitor and serial consoles only.
    a.flag("-nographic");

    // Graphics adapter for optional remote display, VNC off by default.
    a.opt("-device", "VGA,id=vga-pci0,vgamem_mb=32");
    a.opt("-vnc", "none");
    a.opt("-device", "qemu-xhci,id=qemu-xhci-pci0");
    a.opt("-device", "usb-tablet,bus=qemu-xhci-pci0.0,id=usb-tablet0");
    a.opt("-k", "en-us");

    a.opt("-parallel", "none");

    // Monitor on the session's own terminal.
    a.opt("-chardev", "stdio,id=monitor0,mux=off,signal=off");
    a.opt("-monitor", "chardev:monitor0");

    // Serial consoles on local sockets; `nowait` lets the machine boot
    // before any bridge connects.
    for i in 0..CONSOLE_COUNT {
        a.opt(
            "-chardev",
            format!(
                "socket,server,nowait,id=console{i},path={}",
                console_socket_path(&facts.runtime_dir, i).display()
            ),
        );
        a.opt("-serial", format!("chardev:console{i}"));
    }

    let mut env = base_env(facts);
    env.insert("HOME".to_string(), work_dir.display().to_string());
    env.insert("APP_RUNTIME_DIR".to_string(), runtime.clone());
    // Used by the user-mode network stack's DNS.
    env.insert("CONFIG_QEMU_DNS".to_string(), facts.upstream_dns.clone());

    Ok(LaunchSpec {
        program,
        argv: a.0,
        env,
        cwd: work_dir,
    })
}

/// Build the command line for the bridge attached to console `index`.
///
/// socat keeps retrying every 0.1 s for as long as the socket is absent or
/// the connection drops, so a bridge outlives machine restarts.
pub fn build_bridge(index: usize, facts: &HostFacts) -> Result<LaunchSpec> {
    if index >= CONSOLE_COUNT {
        return Err(Error::ConsoleOutOfRange(index));
    }
    let program = facts.bridge_executable.require()?.to_path_buf();
    let runtime = facts.runtime_dir.display().to_string();

    let argv = vec![
        program.display().to_string(),
        "/dev/tty,rawer".to_string(),
        format!(
            "UNIX-CONNECT:{},interval={BRIDGE_RETRY_INTERVAL},forever",
            console_socket_path(&facts.runtime_dir, index).display()
        ),
    ];

    let mut env = base_env(facts);
    env.insert("HOME".to_string(), runtime.clone());
    env.insert("PREFIX".to_string(), runtime);

    Ok(LaunchSpec {
        program,
        argv,
        env,
        cwd: facts.runtime_dir.clone(),
    })
}

/// Environment shared by every session.
fn base_env(facts: &HostFacts) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = facts
        .inherited_env
        .iter()
        .filter(|(name, _)| name.as_str() != "PATH")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let path = match &facts.executable_dir {
        Some(dir) => dir.display().to_string(),
        None => facts
            .inherited_env
            .get("PATH")
            .cloned()
            .unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin".to_string()),
    };

    env.insert("LANG".to_string(), "en_US.UTF-8".to_string());
    env.insert("PATH".to_string(), path);
    env.insert("TMPDIR".to_string(), facts.tmp_dir.display().to_string());
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    env
}
