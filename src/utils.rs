
/// Extract host and port from a Host header value, or use defaults.
pub fn parse_host_header(host_header: Option<&str>, default_port: u16) -> (String, u16) {
    match host_header {
        Some(h) => {
            if let Some((host, port_str)) = h.rsplit_once(':') {
                if let Ok(port) = port_str.parse::<u16>() {
                    return (host.to_string(), port);
                }
            }
            (h.to_string(), default_port)
        }
        None => ("localhost".to_string(), default_port),
    }
}
