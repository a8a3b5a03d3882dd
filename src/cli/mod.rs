//! Terminal output for fleetctl commands.

pub mod session;

use std::io::{self, Write};

use crate::api::{Device, Group, PackageInfo, Page};
use crate::core::{BatchSummary, OperationRecord, RecordStatus};

/// Print one line per record, then the summary.
pub fn print_records<S: RecordStatus>(records: &[OperationRecord<S>], summary: &BatchSummary<S>) {
    let mut out = io::stdout().lock();
    for record in records {
        let _ = writeln!(out, "{}", record_line(record));
    }
    let _ = writeln!(out, "{summary}");
}

pub fn record_line<S: RecordStatus>(record: &OperationRecord<S>) -> String {
    let id = if record.device_id.is_empty() {
        "-"
    } else {
        record.device_id.as_str()
    };
    let mut line = format!(
        "{id:<16} {:<20} {:<10}",
        record.device_name,
        record.status.as_str()
    );
    if record.is_loading {
        line.push_str(" ...");
    }
    if let Some(error) = &record.error {
        line.push_str(&format!(" {error}"));
    } else if let Some(payload) = &record.payload {
        // Shell output may span lines; show the first one inline.
        let first = payload.lines().next().unwrap_or_default();
        line.push_str(&format!(" {first}"));
    }
    line
}

pub fn print_device_page(page: &Page<Device>) {
    let mut out = io::stdout().lock();
    for device in &page.records {
        let _ = writeln!(
            out,
            "{:<16} {:<20} {:<12} {:<15} {}",
            device.id,
            device.name.as_deref().unwrap_or("-"),
            device.group_name.as_deref().unwrap_or("-"),
            device.ip.as_deref().unwrap_or("-"),
            if device.online { "online" } else { "offline" }
        );
    }
    let pages = page.total.div_ceil(u64::from(page.page_size.max(1)));
    let _ = writeln!(
        out,
        "page {} of {} ({} devices)",
        page.page,
        pages.max(1),
        page.total
    );
}

pub fn print_device(device: &Device) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(device)?);
    Ok(())
}

pub fn print_groups(groups: &[Group]) {
    let mut out = io::stdout().lock();
    for group in groups {
        let _ = writeln!(
            out,
            "{:<16} {:<20} {:>4} devices  {}",
            group.id,
            group.name,
            group.device_count,
            group.description.as_deref().unwrap_or("")
        );
    }
}

pub fn print_packages(packages: &[PackageInfo]) {
    let mut out = io::stdout().lock();
    for package in packages {
        let _ = writeln!(
            out,
            "{:<40} {}",
            package.package_name,
            package.version_name.as_deref().unwrap_or("-")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MirrorRecord, MirrorStatus, TaskRecord, TaskStatus};

    #[test]
    fn record_line_shows_error_before_payload() {
        let mut record = MirrorRecord::new(&Device::new("d1", "One"), MirrorStatus::Playing);
        record.payload = Some("http://h:1".into());
        assert!(record_line(&record).ends_with("playing    http://h:1"));

        let orphan = TaskRecord::new(&Device::new("", "Ghost"), TaskStatus::Idle);
        let line = record_line(&orphan);
        assert!(line.starts_with("- "));
        assert!(line.ends_with("missing device id"));
    }
}
