// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! The mining pipeline: pool messages in, jobs to the chips, shares
//! back out. One task per stage, bounded queues in between, and a
//! generation counter that lets a work abandon cut through all of
//! them at once.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time;

use crate::bm13xx::{self, ChipDriver};
use crate::config::{self, Config};
use crate::error::{self, ErrorKind};
use crate::io::{ResetPin, SerialUart, DEFAULT_BAUD};
use crate::job::{Job, JobTable};
use crate::stratum::{self, PoolMessage};
use crate::work::{self, JobTemplate};
use crate::{debug, info, warn};

/// Jobs buffered ahead of the chip; the generator stalls at the bound
const JOB_QUEUE_DEPTH: usize = 8;

/// How long one `process_work` poll holds the bus before the sender
/// gets a chance to interleave
const RESULT_POLL: Duration = Duration::from_millis(100);

/// Difficulty suggested to the pool before it tells us otherwise
const SUGGESTED_DIFFICULTY: u32 = 1000;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Pool-side parameters that change mid-session
struct PoolState {
    difficulty: u32,
    version_mask: u32,
}

type SharedDriver = Arc<Mutex<Box<dyn ChipDriver>>>;
type SharedTable = Arc<Mutex<JobTable>>;

/// Bring the chain up and keep mining until the process dies,
/// reconnecting to the pool whenever the session drops.
pub async fn run(config: Config) -> error::Result<()> {
    let chain = &config.hash_chain;
    let mut reset = ResetPin::open(chain.reset_gpio)?;
    let uart = SerialUart::open(&chain.serial_port, DEFAULT_BAUD)?;
    let mut driver = bm13xx::make_driver(chain.chip_model, Box::new(uart));

    reset.pulse().await?;
    let chips = driver
        .init(
            chain.frequency,
            chain.chip_count,
            Duration::from_millis(config::PROBE_TIMEOUT_MS),
        )
        .await?;
    let baud = driver.set_max_baud().await?;
    info!(
        "{}: {} chip(s) at {:.2} MHz, bus at {} baud",
        chain.chip_model, chips, chain.frequency, baud
    );
    if chain.asic_difficulty != driver.default_difficulty() {
        driver.set_difficulty_mask(chain.asic_difficulty).await?;
    }
    let driver: SharedDriver = Arc::new(Mutex::new(driver));

    loop {
        if let Err(e) = session(&config, driver.clone()).await {
            warn!("session ended: {}, reconnecting", e);
        }
        time::sleep(RECONNECT_DELAY).await;
    }
}

/// One pool connection: handshake, then the four pipeline tasks until
/// any of them fails
async fn session(config: &Config, driver: SharedDriver) -> error::Result<()> {
    let mut client =
        stratum::Client::connect(&config.stratum.url, &config.stratum.user).await?;
    client
        .handshake(&config.stratum.password, SUGGESTED_DIFFICULTY)
        .await?;

    let extranonce1 = client.extranonce1.clone();
    let extranonce2_size = client.extranonce2_size;
    let state = Arc::new(StdMutex::new(PoolState {
        difficulty: SUGGESTED_DIFFICULTY,
        version_mask: client.version_mask,
    }));
    driver
        .lock()
        .await
        .set_version_mask(client.version_mask)
        .await?;

    let (receiver, submitter) = client.split();

    let table: SharedTable = Arc::new(Mutex::new(JobTable::new()));
    let (generation_tx, generation_rx) = watch::channel(0u64);
    let (template_tx, template_rx) = watch::channel(None::<JobTemplate>);
    let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE_DEPTH);

    let mut generator = tokio::spawn(generator_task(
        template_rx,
        job_tx,
        state.clone(),
        generation_rx.clone(),
        extranonce1,
        extranonce2_size,
    ));
    let mut sender = tokio::spawn(sender_task(
        driver.clone(),
        table.clone(),
        job_rx,
        generation_rx,
    ));
    let mut results = tokio::spawn(result_task(driver.clone(), table.clone(), submitter));

    let outcome = tokio::select! {
        res = pool_task(receiver, state, template_tx, generation_tx, table, driver) => res,
        res = &mut generator => flatten(res),
        res = &mut sender => flatten(res),
        res = &mut results => flatten(res),
    };
    generator.abort();
    sender.abort();
    results.abort();
    outcome
}

fn flatten(joined: Result<error::Result<()>, tokio::task::JoinError>) -> error::Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ErrorKind::General(format!("pipeline task died: {}", e)).into()),
    }
}

/// Stratum receiver: turns pool messages into template updates, state
/// changes and work abandons
async fn pool_task(
    mut receiver: stratum::Receiver,
    state: Arc<StdMutex<PoolState>>,
    template_tx: watch::Sender<Option<JobTemplate>>,
    generation_tx: watch::Sender<u64>,
    table: SharedTable,
    driver: SharedDriver,
) -> error::Result<()> {
    // a difficulty change invalidates queued work, but only the next
    // notify carries jobs built for the new difficulty
    let mut difficulty_changed = false;
    loop {
        match receiver.next_message().await? {
            PoolMessage::Notify(template) => {
                if template.clean_jobs || difficulty_changed {
                    if difficulty_changed {
                        info!("pool difficulty changed, abandoning queued work");
                        difficulty_changed = false;
                    } else {
                        info!("clean_jobs set, abandoning queued work");
                    }
                    generation_tx.send_modify(|generation| *generation += 1);
                    table.lock().await.invalidate_all();
                }
                debug!("new job template {}", template.job_id);
                template_tx.send_replace(Some(template));
            }
            PoolMessage::SetDifficulty(difficulty) => {
                let mut state = state.lock().expect("state lock");
                if state.difficulty != difficulty {
                    info!("pool difficulty {} -> {}", state.difficulty, difficulty);
                    state.difficulty = difficulty;
                    difficulty_changed = true;
                }
            }
            PoolMessage::SetVersionMask(mask) => {
                info!("pool version mask {:08x}", mask);
                state.lock().expect("state lock").version_mask = mask;
                driver.lock().await.set_version_mask(mask).await?;
            }
            PoolMessage::SubmitResult { id, accepted } => {
                let stats = receiver.stats();
                info!(
                    "share {} {}: {} accepted / {} rejected",
                    id,
                    if accepted { "accepted" } else { "rejected" },
                    stats.accepted,
                    stats.rejected
                );
            }
        }
    }
}

/// Job generator: one template in, a stream of unique-coinbase jobs
/// out, until the template is replaced
async fn generator_task(
    mut templates: watch::Receiver<Option<JobTemplate>>,
    jobs: mpsc::Sender<Job>,
    state: Arc<StdMutex<PoolState>>,
    generation: watch::Receiver<u64>,
    extranonce1: String,
    extranonce2_size: usize,
) -> error::Result<()> {
    let mut extranonce2: u64 = 0;
    loop {
        let current = templates.borrow_and_update().clone();
        let template = match current {
            Some(template) => template,
            None => {
                if templates.changed().await.is_err() {
                    return Ok(());
                }
                continue;
            }
        };
        loop {
            let (difficulty, version_mask) = {
                let state = state.lock().expect("state lock");
                (state.difficulty, state.version_mask)
            };
            extranonce2 += 1;
            let job = work::build(
                &template,
                &extranonce1,
                extranonce2,
                extranonce2_size,
                version_mask,
                difficulty,
                *generation.borrow(),
            )?;
            tokio::select! {
                sent = jobs.send(job) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
                changed = templates.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    break;
                }
            }
        }
    }
}

/// ASIC sender: feeds the chip one job per interval, cutting the wait
/// short when a work abandon invalidates the flow
async fn sender_task(
    driver: SharedDriver,
    table: SharedTable,
    mut jobs: mpsc::Receiver<Job>,
    mut generation: watch::Receiver<u64>,
) -> error::Result<()> {
    loop {
        let job = match jobs.recv().await {
            Some(job) => job,
            None => return Ok(()),
        };
        if job.generation != *generation.borrow_and_update() {
            debug!("dropping job from abandoned generation {}", job.generation);
            continue;
        }
        let interval = {
            let mut driver = driver.lock().await;
            let mut table = table.lock().await;
            driver.send_work(&mut table, job).await?;
            driver.job_interval()
        };
        tokio::select! {
            _ = time::sleep(interval) => {}
            _ = generation.changed() => {}
        }
    }
}

/// Result receiver: polls the chip for nonces, validates them against
/// the job table and submits whatever meets the pool difficulty
async fn result_task(
    driver: SharedDriver,
    table: SharedTable,
    mut submitter: stratum::Submitter,
) -> error::Result<()> {
    let mut previous: Option<(u8, u32)> = None;
    loop {
        let result = {
            let mut driver = driver.lock().await;
            let table = table.lock().await;
            driver.process_work(&table, RESULT_POLL).await?
        };
        let result = match result {
            Some(result) => result,
            None => continue,
        };
        if previous == Some((result.job_id, result.nonce)) {
            warn!("duplicate nonce {:08x}, not resubmitting", result.nonce);
            continue;
        }
        let (job, submit_version) = {
            let driver = driver.lock().await;
            let table = table.lock().await;
            match table.get(result.job_id) {
                Some(job) => (job.clone(), driver.submit_version(job, result.version)),
                None => continue,
            }
        };
        let difficulty = work::nonce_difficulty(&job, result.nonce, result.version);
        if difficulty < f64::from(job.pool_difficulty) {
            debug!(
                "nonce {:08x} below pool difficulty: {:.1} < {}",
                result.nonce, difficulty, job.pool_difficulty
            );
            continue;
        }
        previous = Some((result.job_id, result.nonce));
        let id = submitter
            .submit(&job, result.nonce, submit_version)
            .await?;
        info!(
            "submitted share {}: job {} nonce {:08x} difficulty {:.1}",
            id, job.pool_job_id, result.nonce, difficulty
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::test_utils::MockUart;
    use crate::job::test_utils::sample_job;

    fn template() -> JobTemplate {
        JobTemplate {
            job_id: "1".to_string(),
            prev_hash: "bf44fd3513dc7b837d60e5c628b572b448d204a8000007490000000000000000"
                .to_string(),
            coinbase1: String::new(),
            coinbase2: String::new(),
            merkle_branches: Vec::new(),
            version: 0x20000004,
            nbits: 0x1705dd01,
            ntime: 0x64658bd8,
            clean_jobs: false,
        }
    }

    #[tokio::test]
    async fn generator_renders_unique_extranonces() {
        let state = Arc::new(StdMutex::new(PoolState {
            difficulty: 1000,
            version_mask: 0,
        }));
        let (_generation_tx, generation_rx) = watch::channel(0u64);
        let (template_tx, template_rx) = watch::channel(Some(template()));
        let (job_tx, mut job_rx) = mpsc::channel(JOB_QUEUE_DEPTH);

        let generator = tokio::spawn(generator_task(
            template_rx,
            job_tx,
            state,
            generation_rx,
            "e9695791".to_string(),
            4,
        ));

        let first = job_rx.recv().await.unwrap();
        let second = job_rx.recv().await.unwrap();
        assert_eq!(first.extranonce2, "01000000");
        assert_eq!(second.extranonce2, "02000000");
        assert_ne!(first.merkle_root, second.merkle_root);
        assert_eq!(first.generation, 0);
        assert_eq!(first.pool_difficulty, 1000);

        drop(template_tx);
        drop(job_rx);
        generator.await.unwrap().unwrap();
    }

    fn nonce_response(nonce: u32, job_id: u8) -> Vec<u8> {
        let mut bytes = vec![0xaa, 0x55];
        bytes.extend_from_slice(&nonce.to_le_bytes());
        bytes.extend_from_slice(&[0x01, job_id, 0x54, 0xb3, 0x00]);
        bytes[10] = crate::crc::crc5(&bytes[2..10]);
        bytes
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn result_task_submits_only_qualifying_nonces() {
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::net::TcpListener;

        let (job, nonce, _) = crate::work::test_utils::solved_block_839900();

        let uart = MockUart::new();
        // a solving nonce, the chip repeating it, one that misses the
        // pool difficulty, then the solving nonce against a second slot
        uart.queue_rx(&nonce_response(nonce, 0x0b));
        uart.queue_rx(&nonce_response(nonce, 0x0b));
        uart.queue_rx(&nonce_response(nonce.wrapping_add(1), 0x0b));
        uart.queue_rx(&nonce_response(nonce, 0x13));

        let driver: SharedDriver = Arc::new(Mutex::new(bm13xx::make_driver(
            config::ChipModel::Bm1366,
            Box::new(uart),
        )));
        let table: SharedTable = Arc::new(Mutex::new(JobTable::new()));
        table.lock().await.insert(8, job.clone());
        table.lock().await.insert(16, job);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            let mut received = Vec::new();
            for _ in 0..2 {
                received.push(lines.next_line().await.unwrap().unwrap());
            }
            // neither the repeat nor the miss may produce a line
            let extra = time::timeout(Duration::from_millis(200), lines.next_line()).await;
            assert!(extra.is_err());
            received
        });

        let client = stratum::Client::connect(&addr.to_string(), "worker.one")
            .await
            .unwrap();
        let (_receiver, submitter) = client.split();
        let results = tokio::spawn(result_task(driver, table, submitter));

        let received = pool.await.unwrap();
        results.abort();

        assert!(received[0].contains("mining.submit"));
        assert!(received[0].contains(r#""185abf4","","66221bdf","d2608517","0a966000""#));
        assert!(received[1].contains(r#""d2608517","0a966000""#));
    }

    #[tokio::test(start_paused = true)]
    async fn sender_drops_abandoned_generation() {
        let uart = MockUart::new();
        let driver: SharedDriver = Arc::new(Mutex::new(bm13xx::make_driver(
            config::ChipModel::Bm1366,
            Box::new(uart.clone()),
        )));
        let table: SharedTable = Arc::new(Mutex::new(JobTable::new()));
        let (generation_tx, generation_rx) = watch::channel(0u64);
        let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE_DEPTH);

        // the first job predates the abandon, the second survives it
        let stale = sample_job("stale");
        let mut live = sample_job("live");
        live.generation = 1;
        job_tx.send(stale).await.unwrap();
        job_tx.send(live).await.unwrap();
        generation_tx.send_modify(|generation| *generation += 1);
        drop(job_tx);

        let sender = tokio::spawn(sender_task(driver, table.clone(), job_rx, generation_rx));
        sender.await.unwrap().unwrap();

        assert_eq!(uart.sent().len(), 1);
        assert_eq!(table.lock().await.valid_count(), 1);
        assert_eq!(table.lock().await.get(8).unwrap().pool_job_id, "live");
    }
}
