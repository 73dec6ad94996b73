//! Built-in native functions.

use imgtest_core::{NativeContext, NativeError, NativeRegistry};
use std::path::Path;

/// Console setting the disk template writes into the OEM grub.cfg.
const SERIAL_CONSOLE: &str = "console=ttyS0";

const KERNEL_CMDLINE: &str = "/proc/cmdline";
const OEM_GRUB: &str = "/usr/share/oem/grub.cfg";
const HOSTNAME: &str = "/proc/sys/kernel/hostname";

/// Registry with every built-in function.
pub fn registry() -> NativeRegistry {
    let mut registry = NativeRegistry::new();
    registry
        .register("CheckSerialConsole", |ctx| {
            check_serial_console(ctx, Path::new(KERNEL_CMDLINE))
        })
        .register("CheckOemGrub", |ctx| check_oem_grub(ctx, Path::new(OEM_GRUB)))
        .register("CheckHostname", |ctx| check_hostname(ctx, Path::new(HOSTNAME)));
    registry
}

/// The running kernel was booted with the serial console.
fn check_serial_console(ctx: &NativeContext, cmdline: &Path) -> Result<(), NativeError> {
    let cmdline = std::fs::read_to_string(cmdline)?;
    if cmdline.split_whitespace().any(|arg| arg.starts_with(SERIAL_CONSOLE)) {
        println!("kernel command line: {}", cmdline.trim());
        Ok(())
    } else {
        Err(NativeError::failed(
            &ctx.function,
            format!("{SERIAL_CONSOLE} missing from {:?}", cmdline.trim()),
        ))
    }
}

/// The OEM grub.cfg carries the console override.
fn check_oem_grub(ctx: &NativeContext, grub: &Path) -> Result<(), NativeError> {
    let content = std::fs::read_to_string(grub)?;
    let found = content
        .lines()
        .any(|line| line.starts_with("set linux_console=") && line.contains(SERIAL_CONSOLE));
    if found {
        Ok(())
    } else {
        Err(NativeError::failed(
            &ctx.function,
            format!("no linux_console override in {}", grub.display()),
        ))
    }
}

fn check_hostname(ctx: &NativeContext, path: &Path) -> Result<(), NativeError> {
    let hostname = std::fs::read_to_string(path)?;
    let hostname = hostname.trim();
    if hostname.is_empty() || hostname == "localhost" {
        return Err(NativeError::failed(
            &ctx.function,
            format!("hostname not set (got {hostname:?})"),
        ));
    }
    println!("hostname: {hostname}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(function: &str) -> NativeContext {
        NativeContext {
            test: "basic".into(),
            function: function.into(),
        }
    }

    #[test]
    fn registry_has_builtins() {
        assert_eq!(
            registry().names(),
            vec!["CheckHostname", "CheckOemGrub", "CheckSerialConsole"]
        );
    }

    #[test]
    fn serial_console_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmdline");
        std::fs::write(&path, "root=/dev/vda9 console=ttyS0,115200n8 rw\n").unwrap();
        check_serial_console(&ctx("CheckSerialConsole"), &path).unwrap();
    }

    #[test]
    fn serial_console_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmdline");
        std::fs::write(&path, "root=/dev/vda9 console=tty0\n").unwrap();
        let err = check_serial_console(&ctx("CheckSerialConsole"), &path).unwrap_err();
        assert!(err.to_string().starts_with("CheckSerialConsole failed"));
    }

    #[test]
    fn oem_grub_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grub.cfg");
        std::fs::write(
            &path,
            "set oem_id=\"qemu\"\nset linux_console=\"console=ttyS0,115200\"\n",
        )
        .unwrap();
        check_oem_grub(&ctx("CheckOemGrub"), &path).unwrap();

        std::fs::write(&path, "set oem_id=\"qemu\"\n").unwrap();
        assert!(check_oem_grub(&ctx("CheckOemGrub"), &path).is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = check_oem_grub(&ctx("CheckOemGrub"), Path::new("/nonexistent/grub.cfg"))
            .unwrap_err();
        assert!(matches!(err, NativeError::Io(_)));
    }

    #[test]
    fn hostname_must_be_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostname");
        std::fs::write(&path, "localhost\n").unwrap();
        assert!(check_hostname(&ctx("CheckHostname"), &path).is_err());
        std::fs::write(&path, "m1.example\n").unwrap();
        check_hostname(&ctx("CheckHostname"), &path).unwrap();
    }
}
