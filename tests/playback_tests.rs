// Integration tests for streamed playback
//
// Speech chunks go through the jitter-buffered player into a WAV file so the
// result can be inspected after the fact.

use anyhow::Result;
use loqa_voice::audio::{pcm, AudioOutput, WavOutput};
use loqa_voice::playback::{PlaybackChunk, Player, PlayerConfig, PlayerEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn speech_chunk(samples: usize, value: f32) -> PlaybackChunk {
    let bytes = pcm::samples_to_bytes(&vec![value; samples]);
    PlaybackChunk::new(bytes).expect("even-length chunk")
}

async fn next_finished(events: &mut broadcast::Receiver<PlayerEvent>) -> u64 {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for playback")
            .expect("player stopped");
        if let PlayerEvent::UnitFinished { id } = event {
            return id;
        }
    }
}

#[tokio::test]
async fn test_burst_is_written_as_one_unit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("speech.wav");
    let wav = Arc::new(WavOutput::create(&path, pcm::PLAYBACK_SAMPLE_RATE, false)?);

    let player = Player::spawn(wav.clone() as Arc<dyn AudioOutput>, PlayerConfig::default());
    let mut events = player.subscribe();

    for _ in 0..3 {
        player.enqueue(speech_chunk(2400, 0.3));
    }

    let started = tokio::time::timeout(Duration::from_secs(5), events.recv()).await??;
    assert_eq!(
        started,
        PlayerEvent::UnitStarted {
            id: 1,
            byte_len: 14_400,
            chunk_count: 3
        }
    );
    assert_eq!(next_finished(&mut events).await, 1);

    player.shutdown().await;
    wav.finalize()?;

    let reader = hound::WavReader::open(&path)?;
    assert_eq!(reader.spec().sample_rate, 24_000);
    assert_eq!(reader.spec().channels, 1);
    let samples: Vec<i16> = reader.into_samples::<i16>().collect::<Result<_, _>>()?;
    assert_eq!(samples.len(), 7200);

    // Edges are faded, the middle carries the 1.5x playback gain
    assert_eq!(samples[0], 0);
    let middle = samples[3600];
    assert!((middle as f32 / 32767.0 - 0.45).abs() < 0.001, "middle sample {}", middle);

    Ok(())
}

#[tokio::test]
async fn test_separate_bursts_play_in_order() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("turns.wav");
    let wav = Arc::new(WavOutput::create(&path, pcm::PLAYBACK_SAMPLE_RATE, false)?);

    let config = PlayerConfig {
        jitter_window: Duration::from_millis(50),
        ..PlayerConfig::default()
    };
    let player = Player::spawn(wav.clone() as Arc<dyn AudioOutput>, config);
    let mut events = player.subscribe();

    player.enqueue(speech_chunk(1200, 0.2));
    assert_eq!(next_finished(&mut events).await, 1);

    player.enqueue(speech_chunk(2400, -0.2));
    assert_eq!(next_finished(&mut events).await, 2);

    let stats = player.stats().await;
    assert_eq!(stats.units_played, 2);
    assert_eq!(stats.bytes_played, 7200);
    assert_eq!(stats.queued_chunks, 0);
    assert!(!stats.draining);

    player.shutdown().await;
    wav.finalize()?;

    let samples: Vec<i16> = hound::WavReader::open(&path)?
        .into_samples::<i16>()
        .collect::<Result<_, _>>()?;
    assert_eq!(samples.len(), 3600);
    assert!(samples[600] > 0, "first unit is positive");
    assert!(samples[1200 + 1200] < 0, "second unit is negative");

    Ok(())
}

#[test]
fn test_odd_length_chunk_is_rejected() {
    assert!(PlaybackChunk::new(vec![0u8; 3]).is_err());
    assert!(PlaybackChunk::from_base64("not base64!").is_err());
}
