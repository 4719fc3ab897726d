//! Kernel command line.
//!
//! Quote-aware tokenizer plus typed accessors. Options tolerate any
//! number of leading dashes, so `--init-path=`, `-init-path=` and
//! `init-path=` are the same option.

use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use spin::RwLock;

static ARGS: RwLock<Vec<String>> = RwLock::new(Vec::new());

const HELP_TEXT: &str = "\
helion kernel usage:
NOTE: any number of dashes may precede an option.
--no-init: do not launch the init process.
--init-path=path: path of the init binary (default /bin/init).
--root-fs-uuid=uuid: partition to mount as root ('initrd' uses the initrd).
--root-fs-partid=partid: partition to mount as root by table index.
--mount-initrd=pathspec: mount the initrd at pathspec.
--initrd-module=name: name or path of the initrd module.
--initrd-driver-module=name: name or path of the initrd driver module.
--load-modules=a[,b]: drivers to load at boot.
--enable-kdbg: enable the kernel debugger at boot.
--early-table-access-buf-size=N: early ACPI table buffer size.
--acpi-no-osi: do not report _OSI strings.
--acpi-bad-xsdt: assume the XSDT is broken and use the RSDT.
--help: show this message.
";

/// Split the boot command line into arguments, honoring single and
/// double quotes with backslash escapes.
pub fn parse(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for ch in raw.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quote.is_some() => escaped = true,
            '"' | '\'' => match quote {
                Some(q) if q == ch => quote = None,
                Some(_) => current.push(ch),
                None => quote = Some(ch),
            },
            c if c.is_whitespace() && quote.is_none() => {
                if !current.is_empty() {
                    args.push(core::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Record the boot command line. Prints the help text when `--help` is
/// among the options.
pub fn init(raw: &str) {
    let args = parse(raw);
    *ARGS.write() = args;
    if get_flag("help") {
        crate::platform::console_write(HELP_TEXT);
    }
}

fn strip_dashes(arg: &str) -> &str {
    arg.trim_start_matches('-')
}

/// Whether a bare flag (no `=value`) is present.
pub fn get_flag(name: &str) -> bool {
    ARGS.read().iter().any(|a| strip_dashes(a) == name)
}

/// String value of an `option=value` argument.
pub fn get_str(name: &str) -> Option<String> {
    ARGS.read().iter().find_map(|a| {
        let stripped = strip_dashes(a);
        let (key, value) = stripped.split_once('=')?;
        if key == name {
            Some(value.to_string())
        } else {
            None
        }
    })
}

/// Integer value of an `option=value` argument.
pub fn get_u64(name: &str) -> Option<u64> {
    get_str(name).and_then(|v| {
        if let Some(hex) = v.strip_prefix("0x") {
            u64::from_str_radix(hex, 16).ok()
        } else {
            v.parse().ok()
        }
    })
}

/// Comma-separated list value.
pub fn get_list(name: &str) -> Vec<String> {
    get_str(name)
        .map(|v| v.split(',').map(|s| s.to_string()).collect())
        .unwrap_or_default()
}
