use crate::db::UnresolvedDeletion;
use crate::removal::RemovalOutcome;
use chrono::{DateTime, Local, Utc};

pub fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| {
            dt.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S %:z")
                .to_string()
        })
        .unwrap_or_else(|| format!("Некорректный timestamp: {}", ts))
}

pub fn render_unresolved_line(row: &UnresolvedDeletion) -> String {
    let wg = if row.wg_public_key.is_empty() {
        String::new()
    } else {
        format!(" | wg {}", row.wg_public_key)
    };
    format!(
        "• #{} | {} | key {} | server {}{} | {}",
        row.id,
        row.name_key,
        row.key_id,
        row.server_id,
        wg,
        format_timestamp(row.created_at)
    )
}

pub fn render_unresolved_page(total: i64, rows: &[UnresolvedDeletion]) -> String {
    if rows.is_empty() {
        return "Неудалённых ключей нет ✅".to_string();
    }
    let mut out = format!("Неудалённые ключи: {} (показано {})\n\n", total, rows.len());
    for row in rows {
        out.push_str(&render_unresolved_line(row));
        out.push('\n');
    }
    out.push_str("\n/purge <id> — повторить удаление\n/forget <id> — отметить удалённым");
    out
}

pub fn render_outcome(row_id: i64, outcome: RemovalOutcome) -> String {
    match outcome {
        RemovalOutcome::Deleted => format!("#{}: ключ удалён с сервера ✅", row_id),
        RemovalOutcome::Queued => {
            format!("#{}: сервер недоступен, удаление поставлено в очередь ⏳", row_id)
        }
        RemovalOutcome::Lost => format!("#{}: не удалось ни удалить, ни поставить в очередь ❌", row_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, wg_public_key: &str) -> UnresolvedDeletion {
        UnresolvedDeletion {
            id,
            name_key: "5001.42.wg".to_string(),
            key_id: 42,
            server_id: 7,
            wg_public_key: wg_public_key.to_string(),
            created_at: 0,
        }
    }

    #[test]
    fn empty_page_says_nothing_pending() {
        assert_eq!(render_unresolved_page(0, &[]), "Неудалённых ключей нет ✅");
    }

    #[test]
    fn line_shows_public_key_only_when_present() {
        assert!(render_unresolved_line(&row(1, "abcXYZ==")).contains(" | wg abcXYZ=="));
        assert!(!render_unresolved_line(&row(1, "")).contains(" | wg "));
    }

    #[test]
    fn page_lists_every_row() {
        let text = render_unresolved_page(5, &[row(1, ""), row(2, "")]);
        assert!(text.starts_with("Неудалённые ключи: 5 (показано 2)"));
        assert!(text.contains("#1 |"));
        assert!(text.contains("#2 |"));
    }
}
