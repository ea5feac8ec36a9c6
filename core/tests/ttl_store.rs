use std::time::Duration;

use parley_core::kv::keys;
use parley_core::messages::{Role, Turn};
use parley_core::{Result, TtlStore};

#[tokio::test]
async fn put_get_roundtrip() -> Result<()> {
    let store = TtlStore::new();
    let history = vec![
        Turn::new(Role::System, "You are a voice assistant."),
        Turn::new(Role::User, "Bonjour"),
    ];
    store.put(
        &keys::conversation_history("c1"),
        &history,
        keys::HISTORY_TTL,
    )?;

    let loaded: Option<Vec<Turn>> = store.get(&keys::conversation_history("c1"))?;
    assert_eq!(loaded, Some(history));
    Ok(())
}

#[tokio::test]
async fn expired_entries_read_as_absent_before_sweep() -> Result<()> {
    let store = TtlStore::new();
    store.put("flag", &true, Duration::from_millis(20))?;
    assert!(store.exists("flag"));

    tokio::time::sleep(Duration::from_millis(40)).await;

    // No sweeper running: expiry is enforced at read time.
    assert!(!store.exists("flag"));
    let val: Option<bool> = store.get("flag")?;
    assert!(val.is_none());
    Ok(())
}

#[tokio::test]
async fn refresh_extends_a_live_entry() -> Result<()> {
    let store = TtlStore::new();
    store.put("flag", &true, Duration::from_millis(60))?;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(store.refresh("flag", Duration::from_millis(200)));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(store.exists("flag"), "refresh should have extended the TTL");
    Ok(())
}

#[tokio::test]
async fn refresh_of_expired_or_missing_key_fails() -> Result<()> {
    let store = TtlStore::new();
    assert!(!store.refresh("missing", Duration::from_secs(1)));

    store.put("flag", &true, Duration::from_millis(10))?;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!store.refresh("flag", Duration::from_secs(1)));
    Ok(())
}

#[tokio::test]
async fn delete_is_idempotent() -> Result<()> {
    let store = TtlStore::new();
    store.put("k", &1u32, Duration::from_secs(5))?;
    store.delete("k");
    store.delete("k");
    assert!(!store.exists("k"));
    Ok(())
}

#[tokio::test]
async fn sweeper_reclaims_expired_entries() -> Result<()> {
    let store = TtlStore::new();
    let sweeper = store.start_sweeper(Duration::from_millis(20));

    store.put("short", &1u32, Duration::from_millis(10))?;
    store.put("long", &2u32, Duration::from_secs(60))?;

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!store.exists("short"));
    assert!(store.exists("long"));

    sweeper.abort();
    Ok(())
}

#[test]
fn key_builders_match_wire_names() {
    assert_eq!(keys::conversation_config("c1"), "conversation.config:c1");
    assert_eq!(keys::conversation_history("c1"), "conversation.history:c1");
    assert_eq!(keys::tts_active("c1"), "ttsActive:c1");
}
