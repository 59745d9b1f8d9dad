use pylon_core::{PylonError, Result};
use pylon_protocol::validate::{validate_channel, validate_filter};
use pylon_protocol::{Command, Reply, Role};
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::registry::ConnId;

/// Route one decoded command for a registered connection.
///
/// The role was fixed at handshake; every command is fully validated before
/// any mutation, so a rejected command leaves buffer and registry untouched.
pub fn handle(broker: &Broker, conn: &ConnId, cmd: Command) -> Reply {
    match route(broker, conn, cmd) {
        Ok(reply) => reply,
        Err(err) => {
            debug!(conn_id = %conn, code = err.code(), "command rejected");
            Reply::error(&err)
        }
    }
}

fn route(broker: &Broker, conn: &ConnId, cmd: Command) -> Result<Reply> {
    let Some(role) = broker.role_of(conn) else {
        warn!(conn_id = %conn, "command from unregistered connection");
        return Err(PylonError::Internal("connection not registered".into()));
    };

    match cmd {
        Command::Post { channel, message } => {
            if role != Role::Sender {
                return Err(PylonError::Unauthorized(
                    "client role may not post".to_string(),
                ));
            }
            validate_channel(&channel)?;
            let id = broker.post(channel, message);
            Ok(Reply::success_id(id))
        }

        Command::StartMsg { start } => {
            if role != Role::Client {
                return Err(PylonError::Unauthorized(
                    "start-msg is a subscriber command".to_string(),
                ));
            }
            broker.set_start(conn, start);
            Ok(Reply::success())
        }

        Command::SetFilter { filter } => {
            if role != Role::Client {
                return Err(PylonError::Unauthorized(
                    "set-filter is a subscriber command".to_string(),
                ));
            }
            validate_filter(&filter, broker.max_subscriptions())?;
            broker.set_filter(conn, filter.into_iter().collect());
            Ok(Reply::success())
        }

        Command::LastMsg => Ok(Reply::success_id(broker.last_id())),
    }
}
