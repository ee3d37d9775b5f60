use crate::error::Error;
use crate::promise::{make_promise, Promise};
use crate::queue::Queue;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

/// The answer to a name lookup.
#[derive(Debug, Clone)]
pub struct ResolverResponse {
    pub addresses: Vec<IpAddr>,
}

/// DNS lookups through the system resolver (`getaddrinfo`), each on a
/// short-lived helper thread so the blocking call never touches a worker or
/// the poller.
#[derive(Debug, Clone)]
pub struct Resolver {
    queue: Arc<Queue>,
}

impl Resolver {
    pub fn new(queue: &Arc<Queue>) -> Resolver {
        Resolver {
            queue: queue.clone(),
        }
    }

    pub fn lookup(&self, name: &str) -> Promise<(ResolverResponse,)> {
        let (deferred, promise) = make_promise::<(ResolverResponse,)>(&self.queue);
        let name = name.to_string();

        let spawned = thread::Builder::new()
            .name("rill-resolver".to_string())
            .spawn(move || {
                match (name.as_str(), 0u16).to_socket_addrs() {
                    Ok(addrs) => {
                        let mut addresses: Vec<IpAddr> =
                            addrs.map(|addr| addr.ip()).collect();
                        addresses.dedup();
                        deferred.resolve((ResolverResponse { addresses },));
                    }
                    Err(err) => {
                        tracing::debug!(name = %name, error = %err, "dns lookup failed");
                        deferred.reject(Error::DnsLookup(name));
                    }
                }
            });

        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to spawn resolver thread");
            // The dropped closure takes the deferred with it, rejecting the
            // promise as broken.
        }

        promise
    }
}
