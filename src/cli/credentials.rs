use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use std::io::BufRead;

use super::{Runtime, flag_value, required_flag};
use crate::core::credentials::AuthPayload;
use crate::core::service::ServiceTag;
use crate::core::terminal::{GuideSection, print_success, print_warn};

fn print_usage() {
    GuideSection::new("toolhost credentials")
        .command(
            "add --user U --service S [--refresh-secret X] [--access-token T] [--expires-in SECS]",
            "Reads the secret from stdin when --refresh-secret is omitted",
        )
        .command("list --user U", "")
        .command("deactivate --user U --service S", "")
        .command("remove --user U --service S", "")
        .command("purge [--days N]", "")
        .print();
}

fn read_secret_from_stdin() -> Result<String> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let secret = line.trim().to_string();
    if secret.is_empty() {
        return Err(anyhow!("no refresh secret given on stdin"));
    }
    Ok(secret)
}

/// `--expires-in SECS` as an absolute expiry.
fn expiry_from_now(raw: &str) -> Result<DateTime<Utc>> {
    let secs: i64 = raw
        .parse()
        .map_err(|_| anyhow!("--expires-in must be a number of seconds"))?;
    Duration::try_seconds(secs)
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .ok_or_else(|| anyhow!("--expires-in {} is out of range", secs))
}

/// `--days N` as a purge age.
fn purge_age(raw: &str) -> Result<Duration> {
    let days: i64 = raw
        .parse()
        .map_err(|_| anyhow!("--days must be a whole number"))?;
    if days < 0 {
        return Err(anyhow!("--days must not be negative"));
    }
    Duration::try_days(days).ok_or_else(|| anyhow!("--days {} is out of range", days))
}

fn user_and_service(args: &[String]) -> Result<(String, ServiceTag)> {
    let user = required_flag(args, 3, &["--user", "-u"])?;
    let service = ServiceTag::new(required_flag(args, 3, &["--service", "-s"])?)?;
    Ok((user, service))
}

pub(super) async fn run(rt: &Runtime, args: &[String]) -> Result<()> {
    let sub_cmd = args.get(2).map(String::as_str).unwrap_or("");
    let store = &rt.credentials;

    match sub_cmd {
        "add" => {
            let (user, service) = user_and_service(args)?;
            if rt.registry.get(&service).is_none() {
                print_warn(&format!("Service '{}' is not configured; storing anyway.", service));
            }
            let refresh_secret = match flag_value(args, 3, &["--refresh-secret"]) {
                Some(secret) => secret,
                None => read_secret_from_stdin()?,
            };
            let mut payload = AuthPayload::new(refresh_secret);
            if let Some(token) = flag_value(args, 3, &["--access-token"]) {
                let expires_at = flag_value(args, 3, &["--expires-in"])
                    .map(|secs| expiry_from_now(&secs))
                    .transpose()?;
                payload = payload.with_access_token(token, expires_at);
            }

            let credential = store.create(&user, &service, payload).await?;
            print_success(&format!("Stored credentials for {} on {}", user, service));
            println!("  secret file: {}", credential.secret_path.display());
            Ok(())
        }
        "list" => {
            let user = required_flag(args, 3, &["--user", "-u"])?;
            let summaries = store.list_for_user(&user).await?;
            if summaries.is_empty() {
                print_warn(&format!("No credentials stored for {}", user));
                return Ok(());
            }
            let mut section = GuideSection::new(&format!("Credentials for {}", user));
            for s in summaries {
                let token = match (s.has_access_token, s.token_expires_at) {
                    (true, Some(exp)) => format!("token until {}", exp.format("%Y-%m-%d %H:%M UTC")),
                    (true, None) => "token".to_string(),
                    (false, _) => "no token".to_string(),
                };
                let state = if s.active { "active" } else { "inactive" };
                section = section.command(
                    &s.service,
                    &format!("{}, {}, updated {}", state, token, s.updated_at.format("%Y-%m-%d %H:%M UTC")),
                );
            }
            section.print();
            Ok(())
        }
        "deactivate" => {
            let (user, service) = user_and_service(args)?;
            if store.deactivate(&user, &service).await? {
                print_success(&format!("Deactivated {} for {}", service, user));
            } else {
                print_warn(&format!("No active credentials for {} on {}", user, service));
            }
            Ok(())
        }
        "remove" => {
            let (user, service) = user_and_service(args)?;
            store.delete(&user, &service).await?;
            print_success(&format!("Removed {} credentials for {}", service, user));
            Ok(())
        }
        "purge" => {
            let older_than = match flag_value(args, 3, &["--days"]) {
                Some(days) => purge_age(&days)?,
                None => rt.config.purge_after(),
            };
            let purged = store.purge_stale(older_than).await?;
            print_success(&format!("Purged {} inactive credential(s)", purged));
            Ok(())
        }
        _ => {
            print_usage();
            Err(anyhow!("unknown credentials command '{}'", sub_cmd))
        }
    }
}
