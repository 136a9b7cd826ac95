// SPDX-License-Identifier: GPL-2.0

use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::SocketAddr;
use std::os::unix::net::UnixStream;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::trace;

use crate::recv_msg;
use crate::send_msg;
use crate::AcquireResponse;
use crate::Request;
use crate::Response;

/// A connection to the perflock daemon. The lock, once acquired, is
/// held for the lifetime of this connection; dropping the client (or
/// dying) releases it.
pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Connect to the daemon at `path`. A leading `@` addresses the
    /// abstract socket namespace.
    pub fn connect(path: &str) -> Result<Client> {
        let stream = match path.strip_prefix('@') {
            Some(name) => SocketAddr::from_abstract_name(name)
                .and_then(|addr| UnixStream::connect_addr(&addr)),
            None => UnixStream::connect(path),
        }
        .with_context(|| format!("connecting to {} (is the perflock daemon running?)", path))?;

        Ok(Client { stream })
    }

    fn roundtrip(&mut self, req: &Request) -> Result<Response> {
        trace!("-> {:?}", req);
        send_msg(&mut self.stream, req)?;
        let resp = recv_msg(&mut self.stream)?;
        trace!("<- {:?}", resp);
        Ok(resp)
    }

    /// Request the lock on behalf of this process. Blocks until granted
    /// unless `non_blocking` is set.
    pub fn acquire(
        &mut self,
        shared: bool,
        non_blocking: bool,
        cores: usize,
        msg: &str,
    ) -> Result<AcquireResponse> {
        let req = Request::Acquire {
            pid: std::process::id(),
            cores,
            shared,
            non_blocking,
            msg: msg.to_string(),
        };
        match self.roundtrip(&req)? {
            Response::Acquire(resp) => Ok(resp),
            other => bail!("unexpected response to acquire: {:?}", other),
        }
    }

    /// Fetch the queue, one line per holder or waiter.
    pub fn list(&mut self) -> Result<Vec<String>> {
        match self.roundtrip(&Request::List)? {
            Response::List(entries) => Ok(entries),
            other => bail!("unexpected response to list: {:?}", other),
        }
    }

    /// Pin the frequency governor to `percent` of the hardware range.
    /// Only valid while holding the lock.
    pub fn set_governor(&mut self, percent: u32) -> Result<()> {
        match self.roundtrip(&Request::SetGovernor { percent })? {
            Response::SetGovernor { err } if err.is_empty() => Ok(()),
            Response::SetGovernor { err } => bail!("{}", err),
            other => bail!("unexpected response to set_governor: {:?}", other),
        }
    }
}
