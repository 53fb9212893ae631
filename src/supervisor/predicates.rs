//! Spawn predicates: pure, synchronous preconditions evaluated once before
//! a service is started. A predicate answers `(should_start, reason)`; the
//! reason is logged when the service is skipped.

use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Budget for the TCP reachability probe.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);

pub type PredicateResult = (bool, Option<String>);
pub type Predicate = Box<dyn Fn() -> PredicateResult + Send + Sync>;

/// True when nothing is listening on `host:port` yet.
pub fn is_port_available(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// The service owns this port; refuse to start when it is already taken.
pub fn port_predicate(host: String, port: u16) -> Predicate {
    Box::new(move || {
        if is_port_available(&host, port) {
            (true, None)
        } else {
            (false, Some(format!("port {host}:{port} already in use")))
        }
    })
}

/// The named executable must resolve on PATH.
pub fn binary_predicate(name: String) -> Predicate {
    Box::new(move || match which::which(&name) {
        Ok(_) => (true, None),
        Err(_) => (false, Some(format!("{name} executable not found in PATH"))),
    })
}

/// A remote endpoint must accept a TCP connection within the probe budget.
pub fn endpoint_predicate(url: String) -> Predicate {
    Box::new(move || {
        let parsed = match url::Url::parse(&url) {
            Ok(parsed) => parsed,
            Err(error) => return (false, Some(format!("invalid endpoint url {url}: {error}"))),
        };
        let Some(host) = parsed.host_str().map(String::from) else {
            return (false, Some(format!("endpoint url {url} has no host")));
        };
        let port = parsed.port_or_known_default().unwrap_or(80);
        let addrs = match (host.as_str(), port).to_socket_addrs() {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(error) => {
                return (
                    false,
                    Some(format!("endpoint {host}:{port} failed to resolve: {error}")),
                )
            }
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok() {
                return (true, None);
            }
        }
        (false, Some(format!("endpoint unreachable at {host}:{port}")))
    })
}

/// All listed environment variables must be set and non-empty.
pub fn env_predicate(vars: Vec<String>) -> Predicate {
    Box::new(move || {
        let missing: Vec<&str> = vars
            .iter()
            .filter(|name| {
                std::env::var(name.as_str())
                    .map(|value| value.trim().is_empty())
                    .unwrap_or(true)
            })
            .map(|name| name.as_str())
            .collect();
        if missing.is_empty() {
            (true, None)
        } else {
            (false, Some(format!("missing env vars: {}", missing.join(", "))))
        }
    })
}

/// AND-combine predicates; the first failure short-circuits with its reason.
pub fn combine(predicates: Vec<Predicate>) -> Predicate {
    Box::new(move || {
        for predicate in &predicates {
            let (ok, reason) = predicate();
            if !ok {
                return (ok, reason);
            }
        }
        (true, None)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupied_port_fails_the_predicate() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let predicate = port_predicate("127.0.0.1".into(), port);
        let (ok, reason) = predicate();
        assert!(!ok);
        assert!(reason.unwrap().contains("already in use"));

        drop(listener);
        let (ok, _) = predicate();
        assert!(ok);
    }

    #[test]
    fn missing_binary_is_reported() {
        let predicate = binary_predicate("definitely-not-a-real-binary-name".into());
        let (ok, reason) = predicate();
        assert!(!ok);
        assert!(reason.unwrap().contains("not found in PATH"));
    }

    #[test]
    fn present_binary_passes() {
        // `sh` exists on every POSIX system this runs on.
        #[cfg(unix)]
        {
            let predicate = binary_predicate("sh".into());
            assert!(predicate().0);
        }
    }

    #[test]
    fn invalid_endpoint_url_fails_with_a_reason() {
        let predicate = endpoint_predicate("not a url".into());
        let (ok, reason) = predicate();
        assert!(!ok);
        assert!(reason.unwrap().contains("invalid endpoint url"));
    }

    #[test]
    fn env_predicate_reports_missing_names() {
        let predicate = env_predicate(vec!["SUZU_TEST_SURELY_UNSET_VARIABLE".into()]);
        let (ok, reason) = predicate();
        assert!(!ok);
        assert!(reason.unwrap().contains("SUZU_TEST_SURELY_UNSET_VARIABLE"));
    }

    #[test]
    fn combine_short_circuits_on_the_first_failure() {
        let predicate = combine(vec![
            Box::new(|| (true, None)),
            Box::new(|| (false, Some("second failed".into()))),
            Box::new(|| (false, Some("third failed".into()))),
        ]);
        let (ok, reason) = predicate();
        assert!(!ok);
        assert_eq!(reason.as_deref(), Some("second failed"));

        let all_pass = combine(vec![Box::new(|| (true, None))]);
        assert!(all_pass().0);
    }
}
