//! `sonalog` - CLI for the sonalog preparedness companion
//!
//! This binary manages the supply inventory and emergency contacts, and
//! shares location and safety status with family members.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{Local, Utc};
use clap::Parser;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{info, warn};

use sonalog::cli::{
    ClearCommand, Cli, Command, ConfigCommand, ContactsCommand, ExportCommand, FamilyCommand,
    ItemsCommand, LocateCommand, ShareLocationCommand, StatusCommand,
};
use sonalog::contacts::{Contacts, NewContact};
use sonalog::family::{self, FamilyChannel};
use sonalog::inventory::{Inventory, NewItem};
use sonalog::location::{AcquireOptions, LocationCapture, LocationFix, LocationRecord};
use sonalog::session::{self, SessionSettings};
use sonalog::sharing::{self, LocationSharePayload};
use sonalog::storage::Bucket;
use sonalog::{init_logging, Config, Storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone())?;

    if let Command::Config(config_cmd) = cli.command {
        return handle_config(&config, config_cmd);
    }

    let store = Storage::open(config.database_path())
        .with_context(|| format!("opening {}", config.database_path().display()))?
        .with_quota(config.storage.quota_bytes);

    match cli.command {
        Command::Items(cmd) => handle_items(&store, cmd),
        Command::Contacts(cmd) => handle_contacts(&store, cmd),
        Command::Locate(cmd) => handle_locate(&config, &store, &cmd).await,
        Command::Status(cmd) => handle_status(&config, &store, &cmd),
        Command::Family(cmd) => handle_family(&config, &store, cmd).await,
        Command::Export(cmd) => handle_export(&store, &cmd),
        Command::Import(cmd) => {
            let summary = sharing::import_from_file(&store, &cmd.file)?;
            if let Some(items) = summary.items {
                println!("Imported {items} item(s).");
            }
            if let Some(contacts) = summary.contacts {
                println!("Imported {contacts} contact(s).");
            }
            Ok(())
        }
        Command::ShareLocation(cmd) => handle_share_location(&config, &store, &cmd).await,
        Command::Stats => handle_stats(&store),
        Command::Clear(cmd) => handle_clear(&store, &cmd),
        Command::Config(_) => Ok(()),
    }
}

fn handle_items(store: &Storage, cmd: ItemsCommand) -> anyhow::Result<()> {
    let inventory = Inventory::new(store);
    let today = Local::now().date_naive();

    match cmd {
        ItemsCommand::List { expiring, json } => {
            let items = match expiring {
                Some(days) => inventory.expiring_soon(today, days)?,
                None => inventory.list()?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
                return Ok(());
            }
            if items.is_empty() {
                println!("No items.");
            }
            for item in &items {
                let expiry = item
                    .expiry_date
                    .map_or_else(|| "-".to_string(), |d| d.to_string());
                println!(
                    "{:<36}  {:<24} {:<9} x{:<4} {:<11} {}",
                    item.id,
                    item.name,
                    item.category.as_str(),
                    item.quantity,
                    expiry,
                    item.expiry_status(today)
                );
                if !item.notes.is_empty() {
                    println!("{:<38}{}", "", item.notes);
                }
            }
        }
        ItemsCommand::Add {
            name,
            category,
            expires,
            quantity,
            notes,
        } => {
            let item = inventory.add(NewItem {
                name,
                category: category.into(),
                expiry_date: expires,
                quantity,
                notes,
            })?;
            println!("Added {} ({})", item.name, item.id);
        }
        ItemsCommand::Edit {
            id,
            name,
            category,
            expires,
            no_expiry,
            quantity,
            notes,
        } => {
            let Some(mut item) = inventory.get(&id)? else {
                bail!("no item with id {id}");
            };
            if let Some(name) = name {
                item.name = name;
            }
            if let Some(category) = category {
                item.category = category.into();
            }
            if no_expiry {
                item.expiry_date = None;
            } else if expires.is_some() {
                item.expiry_date = expires;
            }
            if let Some(quantity) = quantity {
                item.quantity = quantity;
            }
            if let Some(notes) = notes {
                item.notes = notes;
            }
            inventory.replace(item)?;
            println!("Updated {id}");
        }
        ItemsCommand::Remove { id } => {
            if inventory.remove(&id)? {
                println!("Removed {id}");
            } else {
                println!("No item with id {id}");
            }
        }
    }
    Ok(())
}

fn handle_contacts(store: &Storage, cmd: ContactsCommand) -> anyhow::Result<()> {
    let contacts = Contacts::new(store);

    match cmd {
        ContactsCommand::List { json } => {
            let all = contacts.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&all)?);
                return Ok(());
            }
            for contact in &all {
                println!(
                    "{:<36}  {:<20} {:<14} {}",
                    contact.id, contact.name, contact.phone, contact.relationship
                );
                for extra in [&contact.email, &contact.address] {
                    if !extra.is_empty() {
                        println!("{:<38}{extra}", "");
                    }
                }
            }
        }
        ContactsCommand::Add {
            name,
            phone,
            relationship,
            email,
            address,
        } => {
            let contact = contacts.add(NewContact {
                name,
                relationship,
                phone,
                email,
                address,
            })?;
            println!("Added {} ({})", contact.name, contact.id);
        }
        ContactsCommand::Remove { id } => {
            if sonalog::contacts::is_seed(&id) {
                println!("Built-in contact {id} cannot be removed.");
            } else if contacts.remove(&id)? {
                println!("Removed {id}");
            } else {
                println!("No contact with id {id}");
            }
        }
    }
    Ok(())
}

/// Acquire a fix, reusing the stored one while it is fresh, and remember it.
async fn acquire_fix(
    config: &Config,
    store: &Storage,
    settings: &mut SessionSettings,
    fresh: bool,
) -> sonalog::Result<LocationFix> {
    let cached = if fresh {
        None
    } else {
        settings.current_location.clone()
    };
    let capture = LocationCapture::from_config(config)?.with_cached(cached);
    let fix = capture.acquire(&AcquireOptions::from_config(config)).await?;
    settings.set_current_location(fix.clone());
    settings.save(store)?;
    Ok(fix)
}

async fn handle_locate(config: &Config, store: &Storage, cmd: &LocateCommand) -> anyhow::Result<()> {
    let mut settings = SessionSettings::load(store)?;
    let fix = acquire_fix(config, store, &mut settings, cmd.fresh).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&fix)?);
    } else {
        println!("Latitude:   {:.6}", fix.latitude);
        println!("Longitude:  {:.6}", fix.longitude);
        println!("Accuracy:   {:.0} m", fix.accuracy);
        if let Some(address) = &fix.address {
            println!("Address:    {address}");
        }
        println!("Captured:   {}", fix.captured_at.with_timezone(&Local));
    }
    Ok(())
}

fn handle_status(config: &Config, store: &Storage, cmd: &StatusCommand) -> anyhow::Result<()> {
    let today = Local::now().date_naive();
    let inventory = Inventory::new(store);
    let items = inventory.list()?;
    let expired = inventory.expired(today)?;
    let expiring = inventory.expiring_soon(today, cmd.window)?;
    let contacts = Contacts::new(store).list()?;
    let settings = SessionSettings::load(store)?;

    if cmd.json {
        let status = serde_json::json!({
            "items": items.len(),
            "expired": expired,
            "expiring_soon": expiring,
            "contacts": contacts.len(),
            "family": {
                "sharing": settings.realtime_enabled,
                "family_code": settings.family_code,
                "member_name": settings.member_name,
                "status": settings.status,
                "status_message": settings.status_message,
                "current_location": settings.current_location,
            },
            "database_path": config.database_path(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("sonalog status");
    println!("--------------");
    println!("Items:         {}", items.len());
    println!("Expired:       {}", expired.len());
    println!("Expiring:      {} within {} days", expiring.len(), cmd.window);
    for item in &expiring {
        println!("  - {} ({})", item.name, item.expiry_status(today));
    }
    println!("Contacts:      {}", contacts.len());
    println!();
    if settings.realtime_enabled {
        let code = settings
            .family_code
            .as_ref()
            .map_or("-", |code| code.as_str());
        let name = settings.member_name.as_deref().unwrap_or("-");
        println!("Family:        {code} as {name}");
    } else {
        println!("Family:        not sharing");
    }
    println!("My status:     {}", settings.status);
    if let Some(message) = &settings.status_message {
        println!("Message:       {message}");
    }
    if let Some(fix) = &settings.current_location {
        println!(
            "Last location: {:.5}, {:.5} ({})",
            fix.latitude,
            fix.longitude,
            fix.captured_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

/// Join the group stored in the session settings.
async fn rejoin(channel: &FamilyChannel, settings: &SessionSettings) -> anyhow::Result<()> {
    let (true, Some(code), Some(name)) = (
        settings.realtime_enabled,
        settings.family_code.clone(),
        settings.member_name.as_deref(),
    ) else {
        bail!("not sharing with a family; run `sonalog family join <CODE> --name <NAME>` first");
    };
    channel.join(code, name).await?;
    Ok(())
}

async fn handle_family(config: &Config, store: &Storage, cmd: FamilyCommand) -> anyhow::Result<()> {
    let backend = family::backend_from_config(config)?;
    let identity = session::device_identity(store)?;
    let channel = FamilyChannel::new(backend, identity.device_id);
    let mut settings = SessionSettings::load(store)?;

    match cmd {
        FamilyCommand::Create { name } => {
            let code = family::mint_family_code();
            channel.create_family_group(&code).await?;
            println!("Family code: {code}");
            if let Some(name) = name {
                channel.join(code.clone(), &name).await?;
                settings.enable_realtime(code, &name)?;
                settings.save(store)?;
                println!("Sharing as {name}.");
            } else {
                println!("Share this code with your family, then run `sonalog family join {code} --name <NAME>`.");
            }
        }
        FamilyCommand::Join { code, name } => {
            channel.join(code.clone(), &name).await?;
            settings.enable_realtime(code.clone(), &name)?;
            settings.save(store)?;
            println!(
                "Joined {code} as {name}; {} member(s) visible.",
                channel.view().len()
            );
        }
        FamilyCommand::Leave => {
            settings.disable_realtime();
            settings.save(store)?;
            println!("Stopped sharing.");
        }
        FamilyCommand::Publish { status, message } => {
            rejoin(&channel, &settings).await?;
            if let Some(status) = status {
                settings.update_status(status.into(), message.as_deref());
            } else if message.is_some() {
                settings.update_status(settings.status, message.as_deref());
            }
            let fix = acquire_fix(config, store, &mut settings, false).await?;
            let record =
                channel.record_from_fix(&fix, settings.status, settings.status_message.clone())?;
            channel.publish(&record).await?;
            println!(
                "Published {} at {:.5}, {:.5}",
                record.status, record.latitude, record.longitude
            );
        }
        FamilyCommand::Alert { message } => {
            rejoin(&channel, &settings).await?;
            let fix = match acquire_fix(config, store, &mut settings, true).await {
                Ok(fix) => Some(fix),
                Err(e) => {
                    warn!(error = %e, "Could not acquire a fresh location for the alert");
                    settings.current_location.clone()
                }
            };
            let record = channel.emergency_alert(&message, fix.as_ref()).await?;
            settings.update_status(record.status, Some(message.as_str()));
            settings.save(store)?;
            if let Some(code) = channel.family_code() {
                println!("Alert sent to family {code}.");
            }
        }
        FamilyCommand::Members { json } => {
            rejoin(&channel, &settings).await?;
            let members = channel.members();
            if json {
                println!("{}", serde_json::to_string_pretty(&members)?);
            } else {
                print_members(&members);
            }
        }
        FamilyCommand::Watch { no_auto_update } => {
            rejoin(&channel, &settings).await?;
            let interval = if no_auto_update {
                None
            } else {
                config.auto_update_interval()
            };
            watch_family(config, store, &channel, &mut settings, interval).await?;
        }
    }
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn watch_family(
    config: &Config,
    store: &Storage,
    channel: &FamilyChannel,
    settings: &mut SessionSettings,
    auto_update: Option<Duration>,
) -> anyhow::Result<()> {
    let mut changes = channel.watch();
    let mut ticker = auto_update.map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    print_members(&channel.members());
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                if !channel.is_connected() {
                    let reason = channel.last_error().unwrap_or_else(|| "disconnected".to_string());
                    bail!("family channel closed: {reason}");
                }
                println!();
                print_members(&channel.members());
            }
            () = next_tick(&mut ticker) => {
                match acquire_fix(config, store, settings, false).await {
                    Ok(fix) => {
                        let record = channel.record_from_fix(
                            &fix,
                            settings.status,
                            settings.status_message.clone(),
                        )?;
                        if let Err(e) = channel.publish(&record).await {
                            warn!(error = %e, "Auto-update publish failed");
                        } else {
                            info!("Auto-update published");
                        }
                    }
                    Err(e) => warn!(error = %e, "Auto-update skipped, no location"),
                }
                if channel.is_connected() {
                    if let Err(e) = channel.refresh().await {
                        warn!(error = %e, "Refresh failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                channel.leave();
                break;
            }
        }
    }
    Ok(())
}

fn print_members(members: &[LocationRecord]) {
    if members.is_empty() {
        println!("No family members have shared a location yet.");
        return;
    }
    let now = Utc::now();
    for record in members {
        let minutes = (now - record.updated_at).num_minutes().max(0);
        println!(
            "{:<16} {:<10} {:.5}, {:.5} (±{:.0} m)  {minutes} min ago",
            record.member_name,
            record.status.as_str(),
            record.latitude,
            record.longitude,
            record.accuracy
        );
        if let Some(address) = &record.address {
            println!("{:<17}{address}", "");
        }
        if let Some(message) = &record.message {
            println!("{:<17}{message}", "");
        }
        if let Some(battery) = record.battery_level {
            println!("{:<17}battery {battery}%", "");
        }
    }
}

fn handle_export(store: &Storage, cmd: &ExportCommand) -> anyhow::Result<()> {
    if cmd.qr {
        println!("{}", sharing::snapshot_qr_payload(store)?);
    } else {
        let path = sharing::export_to_file(store, &cmd.dir)?;
        println!("Exported to {}", path.display());
    }
    Ok(())
}

async fn handle_share_location(
    config: &Config,
    store: &Storage,
    cmd: &ShareLocationCommand,
) -> anyhow::Result<()> {
    let mut settings = SessionSettings::load(store)?;
    let fix = acquire_fix(config, store, &mut settings, false).await?;
    let name = cmd
        .name
        .clone()
        .or_else(|| settings.member_name.clone())
        .unwrap_or_default();
    let payload = LocationSharePayload::new(settings.family_code.as_ref(), &name, fix);
    println!("{}", payload.to_qr_payload()?);
    Ok(())
}

fn handle_stats(store: &Storage) -> anyhow::Result<()> {
    let stats = store.stats()?;
    println!("Database:      {}", store.path().display());
    for bucket in Bucket::ALL {
        println!("{:<14} {}", format!("{bucket}:"), stats.records(bucket));
    }
    println!("Payload bytes: {}", stats.payload_bytes);
    let quota = store.quota_bytes();
    if quota > 0 {
        println!("Quota bytes:   {quota}");
    }
    println!("File bytes:    {}", stats.db_size_bytes);
    if let Some(at) = stats.last_updated {
        println!("Last write:    {}", at.with_timezone(&Local));
    }
    Ok(())
}

fn handle_clear(store: &Storage, cmd: &ClearCommand) -> anyhow::Result<()> {
    let bucket = Bucket::from(cmd.bucket);
    if !cmd.yes {
        println!("This will delete all stored {bucket} data.");
        println!("Use --yes to confirm.");
        return Ok(());
    }
    if store.clear(bucket)? {
        println!("Cleared {bucket}.");
    } else {
        println!("Nothing stored in {bucket}.");
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Quota (bytes):      {}", config.storage.quota_bytes);
                println!();
                println!("[Location]");
                println!("  Provider:           {:?}", config.location.provider);
                println!("  Timeout (s):        {}", config.location.timeout_secs);
                println!("  Maximum age (s):    {}", config.location.maximum_age_secs);
                println!("  Reverse geocode:    {}", config.location.reverse_geocode);
                println!();
                println!("[Family]");
                println!("  Backend:            {:?}", config.family.backend);
                println!(
                    "  Backend URL:        {}",
                    config.family.backend_url.as_deref().unwrap_or("-")
                );
                println!("  Poll interval (ms): {}", config.family.poll_interval_ms);
                println!(
                    "  Auto-update (min):  {}",
                    config.family.auto_update_minutes
                );
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
