use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::services::archive_service::{format_pgn, GameRecord};

/// Single consumer behind an unbounded queue. A sink failure is logged as a
/// dropped record and never blocks the components that play.
pub fn spawn(path: String, mut rx: mpsc::UnboundedReceiver<GameRecord>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            match append(&path, &record).await {
                Ok(()) => info!("Archived game {} to {}", record.game_id, path),
                Err(e) => error!(
                    "Dropping archive record for game {}: {}",
                    record.game_id, e
                ),
            }
        }
    })
}

async fn append(path: &str, record: &GameRecord) -> std::io::Result<()> {
    let pgn = format_pgn(record);
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(pgn.as_bytes()).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Color, GameStatus};

    fn record(game_id: &str) -> GameRecord {
        GameRecord {
            game_id: game_id.to_string(),
            site: format!("https://lichess.org/{}", game_id),
            white: "knightwatch".to_string(),
            black: "B1".to_string(),
            variant: "standard".to_string(),
            time_control: "180+2".to_string(),
            rated: false,
            initial_fen: None,
            moves: vec!["e2e4".to_string(), "e7e5".to_string()],
            clocks_ms: vec![None, None],
            status: GameStatus::Resign,
            winner: Some(Color::White),
            finished_at: "2024-05-04T12:00:00Z".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_records_are_appended_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.pgn");
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = spawn(path.to_str().unwrap().to_string(), rx);
        tx.send(record("G1")).unwrap();
        tx.send(record("G2")).unwrap();
        drop(tx);
        handle.await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let first = written.find("lichess.org/G1").unwrap();
        let second = written.find("lichess.org/G2").unwrap();
        assert!(first < second);
        assert_eq!(written.matches("[Event ").count(), 2);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_stop_the_consumer() {
        let (tx, rx) = mpsc::unbounded_channel();
        // A directory that does not exist makes every append fail.
        let handle = spawn("/nonexistent-dir/games.pgn".to_string(), rx);
        tx.send(record("G1")).unwrap();
        tx.send(record("G2")).unwrap();
        drop(tx);
        // The consumer drains both records and exits cleanly.
        handle.await.unwrap();
    }
}
