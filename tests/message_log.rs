//! Message log persistence through the public API.

use chrono::{TimeZone, Utc};
use smartbot::message_log::MessageLog;
use tempfile::TempDir;

#[tokio::test]
async fn saved_messages_survive_reopen_newest_first() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("messages.db");

    {
        let log = MessageLog::open(&path).unwrap();
        let t = |h| Some(Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap());
        log.save(1, Some("John".into()), Some("Hello, world!".into()), t(8)).await.unwrap();
        log.save(2, Some("Mary".into()), Some("Morning".into()), t(9)).await.unwrap();
    }

    let log = MessageLog::open(&path).unwrap();
    log.append("smartbot".into(), "Good morning!".into()).await.unwrap();

    let records = log.recent(10).await.unwrap();
    let who: Vec<&str> = records.iter().map(|r| r.username.as_str()).collect();
    assert_eq!(who, vec!["smartbot", "Mary", "John"]);
    assert_eq!(records[2].message, "Hello, world!");
}
