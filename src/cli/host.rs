use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::warn;
use tokio::task::spawn_blocking;

use crate::device::permission::CapabilityHost;
use crate::device::types::{Capability, Grant};

/// Asks the person at the terminal before using the radio. Grants last for the process.
pub struct ConsoleHost {
    granted: Arc<Mutex<HashSet<Capability>>>,
}

impl ConsoleHost {
    pub fn new(assume_yes: bool) -> Self {
        let mut granted = HashSet::new();
        if assume_yes {
            granted.insert(Capability::Scan);
            granted.insert(Capability::Connect);
        }
        ConsoleHost { granted: Arc::new(Mutex::new(granted)) }
    }
}

fn describe(kinds: &[Capability]) -> String {
    kinds
        .iter()
        .map(|kind| match kind {
            Capability::Scan => "scan",
            Capability::Connect => "connect/write",
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn prompt(kinds: &[Capability]) -> io::Result<bool> {
    let mut stderr = io::stderr();
    write!(stderr, "Allow nus-link to use bluetooth ({})? [y/N] ", describe(kinds))?;
    stderr.flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

impl CapabilityHost for ConsoleHost {
    fn has_capability(&self, kind: Capability) -> bool {
        self.granted.lock().expect("Failed to lock granted capabilities").contains(&kind)
    }

    fn request_capabilities(&self, kinds: Vec<Capability>) -> BoxFuture<'static, Grant> {
        let granted = self.granted.clone();

        async move {
            let asked = kinds.clone();
            let answer = spawn_blocking(move || prompt(&asked)).await;

            match answer {
                Ok(Ok(true)) => {
                    let mut granted = granted.lock().expect("Failed to lock granted capabilities");
                    granted.extend(kinds);
                    Grant::Granted
                },
                Ok(Ok(false)) => Grant::Denied,
                Ok(Err(err)) => {
                    warn!("Could not read answer from stdin: {}", err);
                    Grant::Denied
                },
                Err(err) => {
                    warn!("Prompt task failed: {}", err);
                    Grant::Denied
                },
            }
        }.boxed()
    }
}
