/// Baud rate the testbed firmware ships with.
pub const DEFAULT_BAUD: u32 = 115_200;

/// A port a backend can open.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortInfo {
    pub name: String,
    pub driver: String,
}

/// Strip the line terminator (LF, optionally preceded by CR) and surrounding blanks.
pub(crate) fn trim_line(raw: &str) -> &str {
    raw.trim_end_matches(['\n', '\r']).trim()
}

/// Reject outbound text that would break newline framing.
pub(crate) fn check_outbound(line: &str) -> crate::Result<()> {
    if line.contains(['\n', '\r']) {
        return Err(crate::TransportError::InvalidLine("embedded line terminator"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_crlf_and_spaces() {
        assert_eq!(trim_line("readAll>2\r\n"), "readAll>2");
        assert_eq!(trim_line("  eoc \n"), "eoc");
        assert_eq!(trim_line("\r\n"), "");
    }

    #[test]
    fn outbound_lines_cannot_smuggle_terminators() {
        assert!(check_outbound("setLoad").is_ok());
        assert!(check_outbound("1.0\nstop").is_err());
    }
}
