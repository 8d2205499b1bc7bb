//! Kernel command line template expansion.
//!
//! Command line templates support exactly one construct: `{{ID "file-id"}}`,
//! which is replaced with a signed URL for that file id. References fail
//! closed: an unknown function, a bare variable, or unterminated braces abort
//! expansion rather than expanding to an empty string. The expanded command
//! line is a single line by construction; a newline anywhere in the result is
//! an error and nothing is sent to the client.

use crate::error::BootError;

/// Expand a command line template, resolving each `{{ID "x"}}` through
/// `id_url`. The result is trimmed.
pub fn expand_cmdline<F>(template: &str, mut id_url: F) -> Result<String, BootError>
where
    F: FnMut(&str) -> Result<String, BootError>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find("{{") {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 2..];

        rest = rest.trim_start_matches(' ');
        let Some(after_fn) = rest.strip_prefix("ID") else {
            return Err(BootError::BadPacket(format!(
                "cmdline template {template:?}: unknown reference"
            )));
        };
        rest = after_fn.trim_start_matches(' ');

        let Some(after_quote) = rest.strip_prefix('"') else {
            return Err(BootError::BadPacket(format!(
                "cmdline template {template:?}: ID takes a quoted string"
            )));
        };
        let (id, after_id) = scan_quoted(after_quote, template)?;
        rest = after_id.trim_start_matches(' ');

        let Some(after_close) = rest.strip_prefix("}}") else {
            return Err(BootError::BadPacket(format!(
                "cmdline template {template:?}: unterminated {{{{ID ...}}}}"
            )));
        };
        rest = after_close;

        out.push_str(&id_url(&id)?);
    }
    out.push_str(rest);

    let cmdline = out.trim().to_string();
    if cmdline.contains('\n') {
        return Err(BootError::BadPacket(format!(
            "cmdline {cmdline:?} contains a newline"
        )));
    }
    Ok(cmdline)
}

/// Scan a double-quoted string body (opening quote already consumed),
/// honoring `\"` and `\\` escapes. Returns the unescaped content and the
/// remainder after the closing quote.
fn scan_quoted<'a>(input: &'a str, template: &str) -> Result<(String, &'a str), BootError> {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &input[i + 1..])),
            '\\' => match chars.next() {
                Some((_, escaped @ ('"' | '\\'))) => value.push(escaped),
                _ => {
                    return Err(BootError::BadPacket(format!(
                        "cmdline template {template:?}: bad escape"
                    )))
                }
            },
            _ => value.push(c),
        }
    }

    Err(BootError::BadPacket(format!(
        "cmdline template {template:?}: unterminated string"
    )))
}
