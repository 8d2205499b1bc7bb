//! iPXE boot script assembly.
//!
//! The last hop of the chainload: turn a [`BootSpec`] into the script iPXE
//! executes. Every file reference becomes a signed URL pointing back at the
//! file endpoint, so the script carries no raw Booter ids.

use crate::booter::{BootSpec, FileId};
use crate::cmdline::expand_cmdline;
use crate::domain::{format_mac, Machine};
use crate::error::BootError;
use crate::urlsign::{sign_id, SigningKey};

/// Build the iPXE script for `machine` according to `spec`. `base_url` is
/// the origin the client reached us on (e.g. `http://192.168.1.5:80`).
pub(crate) fn assemble_script(
    spec: &BootSpec,
    machine: &Machine,
    base_url: &str,
    key: &SigningKey,
) -> Result<String, BootError> {
    spec.validate()?;

    // A raw script runs on its own terms.
    if let Some(script) = &spec.ipxe_script {
        if script.starts_with("#!ipxe") {
            return Ok(script.clone());
        }
        return Ok(format!("#!ipxe\n{script}"));
    }

    let mac = format_mac(&machine.mac);
    let file_url = |id: &FileId| -> Result<String, BootError> {
        Ok(format!(
            "{base_url}/_/file?name={}&mac={mac}",
            sign_id(id, key)?
        ))
    };

    if let Some(efi) = &spec.efi {
        return Ok(format!("#!ipxe\nchain {}\n", file_url(efi)?));
    }

    let kernel = spec
        .kernel
        .as_ref()
        .ok_or_else(|| BootError::BadPacket("boot spec has no kernel".to_string()))?;

    let mut script = String::from("#!ipxe\n");
    if let Some(message) = &spec.message {
        script.push_str(&format!("echo {message}\n"));
    }

    let cmdline = expand_cmdline(&spec.cmdline, |id| file_url(&FileId::from(id)))?;
    if cmdline.is_empty() {
        script.push_str(&format!("kernel {}\n", file_url(kernel)?));
    } else {
        script.push_str(&format!("kernel {} {}\n", file_url(kernel)?, cmdline));
    }
    for initrd in &spec.initrd {
        script.push_str(&format!("initrd {}\n", file_url(initrd)?));
    }
    script.push_str("boot\n");

    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Firmware;
    use crate::urlsign::{generate_key, open_id};
    use macaddr::{MacAddr, MacAddr6};

    const BASE: &str = "http://192.168.1.5:80";

    fn machine() -> Machine {
        Machine {
            mac: MacAddr::from(MacAddr6::new(0x52, 0x54, 0x00, 0x12, 0x34, 0x56)),
            arch: Firmware::EfiX64,
        }
    }

    /// Extract and verify the signed id from a `/_/file` URL in a script.
    fn decode_url(line: &str, key: &crate::urlsign::SigningKey) -> String {
        let start = line.find("name=").unwrap() + 5;
        let end = line[start..]
            .find('&')
            .map(|i| start + i)
            .unwrap_or(line.len());
        open_id(&line[start..end], key).unwrap().as_str().to_string()
    }

    #[test]
    fn test_kernel_and_initrd_script() {
        let key = generate_key();
        let spec = BootSpec {
            kernel: Some(FileId::from("http://deb.example.org/linux")),
            initrd: vec![FileId::from("http://deb.example.org/initrd.gz")],
            ..Default::default()
        };

        let script = assemble_script(&spec, &machine(), BASE, &key).unwrap();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "#!ipxe");
        assert!(lines[1].starts_with(&format!("kernel {BASE}/_/file?name=")));
        assert!(lines[2].starts_with(&format!("initrd {BASE}/_/file?name=")));
        assert_eq!(lines[3], "boot");
        assert!(script.ends_with('\n'));

        // No raw ids on the wire, but the signed ones decode exactly.
        assert!(!script.contains("deb.example.org"));
        assert_eq!(decode_url(lines[1], &key), "http://deb.example.org/linux");
        assert_eq!(decode_url(lines[2], &key), "http://deb.example.org/initrd.gz");
    }

    #[test]
    fn test_cmdline_ids_are_signed() {
        let key = generate_key();
        let spec = BootSpec {
            kernel: Some(FileId::from("k")),
            cmdline: r#"root=/dev/ram0 config={{ID "cloud-config"}}"#.to_string(),
            ..Default::default()
        };

        let script = assemble_script(&spec, &machine(), BASE, &key).unwrap();
        let kernel_line = script.lines().nth(1).unwrap();
        assert!(kernel_line.contains("root=/dev/ram0 config="));
        let config_part = kernel_line.split("config=").nth(1).unwrap();
        assert_eq!(decode_url(config_part, &key), "cloud-config");
    }

    #[test]
    fn test_efi_script() {
        let key = generate_key();
        let spec = BootSpec {
            efi: Some(FileId::from("https://boot.netboot.xyz/ipxe/netboot.xyz.efi")),
            ..Default::default()
        };

        let script = assemble_script(&spec, &machine(), BASE, &key).unwrap();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "#!ipxe");
        assert!(lines[1].starts_with("chain "));
        assert_eq!(
            decode_url(lines[1], &key),
            "https://boot.netboot.xyz/ipxe/netboot.xyz.efi"
        );
    }

    #[test]
    fn test_raw_script_returned_verbatim() {
        let key = generate_key();
        let raw = "#!ipxe\necho hi\nreboot\n";
        let spec = BootSpec {
            ipxe_script: Some(raw.to_string()),
            ..Default::default()
        };
        let script = assemble_script(&spec, &machine(), BASE, &key).unwrap();
        assert_eq!(script, raw);
    }

    #[test]
    fn test_raw_script_gains_shebang_when_missing() {
        let key = generate_key();
        let spec = BootSpec {
            ipxe_script: Some("echo hi\n".to_string()),
            ..Default::default()
        };
        let script = assemble_script(&spec, &machine(), BASE, &key).unwrap();
        assert_eq!(script, "#!ipxe\necho hi\n");
    }

    #[test]
    fn test_message_is_echoed_before_kernel() {
        let key = generate_key();
        let spec = BootSpec {
            kernel: Some(FileId::from("k")),
            message: Some("Booting test machine".to_string()),
            ..Default::default()
        };
        let script = assemble_script(&spec, &machine(), BASE, &key).unwrap();
        assert_eq!(
            script.lines().nth(1),
            Some("echo Booting test machine")
        );
    }

    #[test]
    fn test_newline_in_cmdline_aborts() {
        let key = generate_key();
        let spec = BootSpec {
            kernel: Some(FileId::from("k")),
            cmdline: "quiet\nsplash".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            assemble_script(&spec, &machine(), BASE, &key),
            Err(BootError::BadPacket(_))
        ));
    }

    #[test]
    fn test_empty_spec_rejected() {
        let key = generate_key();
        assert!(assemble_script(&BootSpec::default(), &machine(), BASE, &key).is_err());
    }
}
