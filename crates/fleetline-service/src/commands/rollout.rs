//! Rollout command

use std::time::Duration;

use anyhow::Result;
use fleetline_rollout::{BundleRef, FirmwareId, UpdateOptions};
use fleetline_service::error::ServiceError;
use fleetline_service::fleet::outcome_error;
use fleetline_service::{Fleet, output};
use tracing::info;

use crate::commands::RolloutArgs;

/// Run one rollout and stream its events until it settles
pub async fn execute(args: &RolloutArgs, fleet: &Fleet, json: bool) -> Result<()> {
    if args.chunk_size == Some(0) || args.timeout == Some(0) {
        return Err(ServiceError::ValidationError(
            "--chunk-size and --timeout must be greater than zero".to_string(),
        )
        .into());
    }

    let bundle = match (&args.target.firmware, &args.target.configuration) {
        (Some(firmware), None) => BundleRef::Firmware(FirmwareId::new(firmware.clone())),
        (None, Some(selector)) => {
            let row = fleet.stage_configuration(&args.device, selector).await?;
            BundleRef::Configuration(row.id)
        }
        _ => {
            return Err(ServiceError::ValidationError(
                "exactly one of --firmware or --configuration is required".to_string(),
            )
            .into());
        }
    };
    let options = options(fleet.config().update_options(), args);

    if args.dry_run {
        fleet
            .supervisor()
            .preflight(&args.device, bundle.update_type(), &bundle, &options)
            .await?;
        output::print_preflight(&args.device, &bundle, json);
        return Ok(());
    }

    info!(device_id = %args.device, bundle = %bundle, "Starting rollout");
    let session = fleet
        .run_rollout(&args.device, bundle, options, |event| {
            output::print_event(event, json);
        })
        .await?;
    fleet.shutdown().await;

    output::print_outcome(&session, json);
    match outcome_error(&session) {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

fn options(defaults: UpdateOptions, args: &RolloutArgs) -> UpdateOptions {
    let mut options = defaults
        .with_force(args.force)
        .with_skip_verification(args.skip_verification);
    if let Some(chunk_size) = args.chunk_size {
        options = options.with_chunk_size(chunk_size);
    }
    if let Some(secs) = args.timeout {
        options = options.with_update_timeout(Duration::from_secs(secs));
    }
    options
}
