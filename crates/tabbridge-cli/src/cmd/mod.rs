//! Command implementations.

pub mod request;
pub mod resource;
pub mod serve;

use tabbridge_types::BridgeError;

use crate::cli::{Cli, Commands};
use tabbridge_types::config::BridgeConfig;

pub const EXIT_USAGE: i32 = 1;
pub const EXIT_CONNECTION: i32 = 2;
pub const EXIT_REQUEST: i32 = 3;

/// A failed command, carrying its exit code class.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{}", .0.wire_message())]
    Bridge(#[from] BridgeError),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) => EXIT_USAGE,
            CliError::Bridge(e) => match e {
                BridgeError::Config(_) => EXIT_USAGE,
                BridgeError::Connection(_)
                | BridgeError::Authentication(_)
                | BridgeError::Disconnected
                | BridgeError::Lock(_)
                | BridgeError::Io(_) => EXIT_CONNECTION,
                _ => EXIT_REQUEST,
            },
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;

/// Run the parsed command to completion.
pub async fn run(cli: Cli, config: BridgeConfig) -> CliResult<()> {
    let compact = cli.compact;
    let connection = request::Connection::from_cli(&cli, &config);
    match cli.command {
        Commands::Serve {
            listen,
            open,
            allow_identifier,
        } => serve::cmd_serve(config.broker, listen, open, allow_identifier).await,
        Commands::Agents => request::cmd_agents(&connection, compact).await,
        Commands::Query {
            target,
            path,
            params,
            callback_index,
        } => {
            request::cmd_query(&connection, target.target(), &path, params.as_deref(), callback_index, compact)
                .await
        }
        Commands::Call {
            target,
            path,
            args,
            callback,
        } => request::cmd_call(&connection, target.target(), &path, &args, callback, compact).await,
        Commands::Introspect { target, path } => {
            request::cmd_introspect(&connection, target.target(), path.as_deref(), compact).await
        }
        Commands::List {
            target,
            resource,
            filter,
        } => {
            let content = resource::list(resource, filter.as_deref())?;
            request::cmd_resource(&connection, target.target(), content, compact).await
        }
        Commands::Create {
            target,
            resource,
            properties,
        } => {
            let content = resource::create(resource, &properties)?;
            request::cmd_resource(&connection, target.target(), content, compact).await
        }
        Commands::Update {
            target,
            resource,
            id,
            properties,
        } => {
            let content = resource::update(resource, &id, &properties)?;
            request::cmd_resource(&connection, target.target(), content, compact).await
        }
        Commands::Remove {
            target,
            resource,
            id,
        } => {
            let content = resource::remove(resource, &id)?;
            request::cmd_resource(&connection, target.target(), content, compact).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Usage("bad".into()).exit_code(), EXIT_USAGE);
        assert_eq!(CliError::from(BridgeError::Disconnected).exit_code(), EXIT_CONNECTION);
        assert_eq!(
            CliError::from(BridgeError::Authentication("nope".into())).exit_code(),
            EXIT_CONNECTION
        );
        assert_eq!(
            CliError::from(BridgeError::Routing("agent chrome:* is not connected".into())).exit_code(),
            EXIT_REQUEST
        );
        assert_eq!(
            CliError::from(BridgeError::Application("No tab with id: 5".into())).exit_code(),
            EXIT_REQUEST
        );
    }

    #[test]
    fn test_error_message_has_no_variant_prefix() {
        let err = CliError::from(BridgeError::Routing("agent chrome:* is not connected".into()));
        assert_eq!(err.to_string(), "agent chrome:* is not connected");
    }
}
