//! Service registry: the static `service_id host port` table the gateway resolves
//! outbound connections against.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use thiserror::Error;

use crate::stream::ConnectionInfo;

#[derive(Error, Debug)]
pub enum Error {
    #[error("line {line}: expected `service_id host port`, got `{text}`")]
    Malformed { line: usize, text: String },
    #[error("line {line}: invalid service_id `{text}`")]
    InvalidServiceId { line: usize, text: String },
    #[error("line {line}: invalid port `{text}`")]
    InvalidPort { line: usize, text: String },
    #[error("line {line}: duplicate service_id {service_id}, first seen at line {first_line}")]
    DuplicateServiceId { line: usize, service_id: u32, first_line: usize },
    #[error("io error reading service registry: {0}")]
    IO(#[from] std::io::Error),
}

/// A service entry: the routing target a `service` field in a carrier envelope resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: u32,
    pub connection_info: ConnectionInfo,
}

/// The parsed, validated set of services the gateway may dial. Immutable once built —
/// the gateway process is restarted to pick up a config change.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<u32, Service>,
}

impl ServiceRegistry {
    /// Parses a registry from `service_id host port` lines. Blank lines and lines starting
    /// with `#` are skipped. Fails on any malformed line or duplicate `service_id` rather
    /// than silently dropping or overwriting an entry.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut services = HashMap::new();
        let mut first_seen_at: HashMap<u32, usize> = HashMap::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (Some(id_text), Some(host), Some(port_text)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(Error::Malformed { line: line_no, text: line.to_string() });
            };
            if parts.next().is_some() {
                return Err(Error::Malformed { line: line_no, text: line.to_string() });
            }

            let id: u32 = id_text
                .parse()
                .map_err(|_| Error::InvalidServiceId { line: line_no, text: id_text.to_string() })?;
            let port: u16 = port_text
                .parse()
                .map_err(|_| Error::InvalidPort { line: line_no, text: port_text.to_string() })?;

            if let Some(&first_line) = first_seen_at.get(&id) {
                return Err(Error::DuplicateServiceId { line: line_no, service_id: id, first_line });
            }
            first_seen_at.insert(id, line_no);

            services.insert(
                id,
                Service {
                    id,
                    connection_info: ConnectionInfo::new(host, port),
                },
            );
        }

        Ok(Self { services })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn get(&self, service_id: u32) -> Option<&Service> {
        self.services.get(&service_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Display for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} service(s)", self.services.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_services_and_skips_comments_and_blank_lines() {
        let text = "\
            # comment\n\
            \n\
            1 orders.internal 9001\n\
            2 quotes.internal 9002\n\
        ";
        let registry = ServiceRegistry::parse(text).unwrap();
        assert_eq!(registry.len(), 2);
        let orders = registry.get(1).unwrap();
        assert_eq!(orders.connection_info.host(), "orders.internal");
        assert_eq!(orders.connection_info.port(), 9001);
    }

    #[test]
    fn rejects_duplicate_service_id() {
        let text = "1 a.internal 1\n1 b.internal 2\n";
        match ServiceRegistry::parse(text) {
            Err(Error::DuplicateServiceId { service_id: 1, first_line: 1, line: 2 }) => {}
            other => panic!("expected duplicate service id error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_line() {
        let text = "1 only-two-fields\n";
        assert!(matches!(ServiceRegistry::parse(text), Err(Error::Malformed { line: 1, .. })));
    }

    #[test]
    fn rejects_non_numeric_service_id() {
        let text = "abc host.internal 80\n";
        assert!(matches!(ServiceRegistry::parse(text), Err(Error::InvalidServiceId { line: 1, .. })));
    }

    #[test]
    fn rejects_non_numeric_port() {
        let text = "1 host.internal not-a-port\n";
        assert!(matches!(ServiceRegistry::parse(text), Err(Error::InvalidPort { line: 1, .. })));
    }

    #[test]
    fn empty_registry_is_valid() {
        let registry = ServiceRegistry::parse("").unwrap();
        assert!(registry.is_empty());
    }
}
