use std::time::Duration;

use hickory_proto::rr::RData;

use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime::AsyncResolver,
};

/// The outcome of expanding a `mongodb+srv://` hostname: the seedlist plus the options the
/// deployment published over TXT.
#[derive(Debug)]
pub(crate) struct ResolvedConfig {
    pub(crate) hosts: Vec<ServerAddress>,
    pub(crate) min_ttl: Duration,
    pub(crate) auth_source: Option<String>,
    pub(crate) replica_set: Option<String>,
}

/// The SRV hostname a client was built from, kept for re-polling the seedlist.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OriginalSrvInfo {
    pub(crate) hostname: String,
    pub(crate) min_ttl: Duration,
}

fn dns_error(message: String) -> Error {
    ErrorKind::DnsResolve { message }.into()
}

/// The `.`-separated labels of a hostname, with any trailing root dot removed.
fn hostname_labels(hostname: &str) -> Vec<&str> {
    let trimmed = hostname.strip_suffix('.').unwrap_or(hostname);
    trimmed.split('.').collect()
}

/// Every SRV target must live under the parent domain of the queried hostname; anything else
/// could redirect the client to an unrelated deployment.
fn verify_parent_domain(original_hostname: &str, target: &str) -> Result<()> {
    let parent = &hostname_labels(original_hostname)[1..];
    let target_labels = hostname_labels(target);

    if target_labels.len() > parent.len() && target_labels.ends_with(parent) {
        Ok(())
    } else {
        Err(dns_error(format!(
            "SRV lookup for {} returned result {}, which does not match domain name {}",
            original_hostname,
            target,
            parent.join(".")
        )))
    }
}

pub(crate) struct SrvResolver {
    resolver: AsyncResolver,
}

impl SrvResolver {
    pub(crate) async fn new() -> Result<Self> {
        Ok(Self {
            resolver: AsyncResolver::new().await?,
        })
    }

    /// Performs the one SRV lookup and the one TXT lookup that a `mongodb+srv://` connection
    /// string calls for.
    pub(crate) async fn resolve_client_options(&self, hostname: &str) -> Result<ResolvedConfig> {
        if hostname_labels(hostname).len() < 3 {
            return Err(Error::invalid_argument(
                "a 'mongodb+srv' hostname must have at least three '.'-delimited parts",
            ));
        }

        let (hosts, min_ttl) = self.seedlist(hostname).await?;
        let (auth_source, replica_set) = self.txt_options(hostname).await?;

        Ok(ResolvedConfig {
            hosts,
            min_ttl,
            auth_source,
            replica_set,
        })
    }

    async fn seedlist(&self, hostname: &str) -> Result<(Vec<ServerAddress>, Duration)> {
        let lookup = self
            .resolver
            .srv_lookup(&format!("_mongodb._tcp.{}", hostname))
            .await?;

        let mut hosts = Vec::new();
        let mut min_ttl = u32::MAX;

        for record in lookup.as_lookup().record_iter() {
            let srv = match record.data() {
                Some(RData::SRV(srv)) => srv,
                _ => continue,
            };

            let target = srv.target().to_utf8();
            verify_parent_domain(hostname, &target)?;

            hosts.push(ServerAddress::Tcp {
                // Re-join the labels so the trailing root dot is gone.
                host: hostname_labels(&target).join("."),
                port: Some(srv.port()),
            });
            min_ttl = min_ttl.min(record.ttl());
        }

        if hosts.is_empty() {
            return Err(dns_error(format!(
                "SRV lookup for {} returned no records",
                hostname
            )));
        }

        Ok((hosts, Duration::from_secs(min_ttl.into())))
    }

    async fn txt_options(&self, hostname: &str) -> Result<(Option<String>, Option<String>)> {
        let lookup = match self.resolver.txt_lookup(hostname).await? {
            Some(lookup) => lookup,
            None => return Ok((None, None)),
        };

        let mut records = lookup.iter();
        let record = match records.next() {
            Some(record) => record,
            None => return Ok((None, None)),
        };
        if records.next().is_some() {
            return Err(dns_error(format!(
                "TXT lookup for {} returned more than one record, but more than one are not \
                 allowed with 'mongodb+srv'",
                hostname,
            )));
        }

        let options: String = record
            .txt_data()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes.as_ref()).into_owned())
            .collect();

        let mut auth_source = None;
        let mut replica_set = None;

        for pair in options.split('&') {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                dns_error(format!(
                    "TXT record string '{}' is not a valid `key=value` option pair",
                    pair
                ))
            })?;

            // Unlike URI options, an unknown option in a TXT record is fatal.
            match key.to_lowercase().as_str() {
                "authsource" => auth_source = Some(value.to_string()),
                "replicaset" => replica_set = Some(value.to_string()),
                other => {
                    return Err(dns_error(format!(
                        "TXT record option '{}' was returned, but only 'authSource' and \
                         'replicaSet' are allowed",
                        other
                    )))
                }
            }
        }

        Ok((auth_source, replica_set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_domain_enforcement() {
        assert!(verify_parent_domain("db.example.com", "a.example.com").is_ok());
        assert!(verify_parent_domain("db.example.com", "a.example.com.").is_ok());
        assert!(verify_parent_domain("db.example.com", "a.b.example.com").is_ok());

        assert!(verify_parent_domain("db.example.com", "a.evil.com").is_err());
        // The target must be below the parent domain, not the parent itself.
        assert!(verify_parent_domain("db.example.com", "example.com").is_err());
    }

    #[test]
    fn label_splitting_strips_trailing_dot() {
        assert_eq!(hostname_labels("a.example.com."), vec!["a", "example", "com"]);
        assert_eq!(hostname_labels("a.example.com"), vec!["a", "example", "com"]);
    }
}
