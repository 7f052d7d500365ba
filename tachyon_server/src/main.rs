use clap::{App, Arg};
use photon::logging;
use tachyon::cluster::{RedisCluster, StepError, StepHandler};
use tachyon::config::NodeConfig;
use tachyon::labor::LaborShared;
use tachyon::net::codec::{Frame, Payload, RespValue};
use tachyon::net::reactor::{Event, Reactor};
use tachyon::worker::Worker;
use photon::StepSeq;
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Step sequence reserved for each worker's cluster router housekeeping.
const CLUSTER_STEP_SEQ: StepSeq = u32::max_value();

/// Stand-in actor builder: completed steps are only logged. A real
/// deployment wires these callbacks into its own step table.
struct LogHandler {
    log: logging::Logger,
}

impl StepHandler for LogHandler {
    fn on_response(&mut self, step_seq: StepSeq, reply: RespValue) {
        logging::debug!(self.log, "step completed";
                        "step_seq" => step_seq,
                        "reply" => ?reply);
    }

    fn on_error(&mut self, step_seq: StepSeq, error: StepError) {
        logging::warn!(self.log, "step failed";
                       "step_seq" => step_seq,
                       "kind" => ?error.kind,
                       "message" => &error.message);
    }
}

fn main() {
    let matches = App::new("tachyond")
        .version("0.1.0")
        .about("Runs the tachyon worker pool.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the node config file")
                .required(true),
        )
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();
    let config = NodeConfig::load(config_file_path);

    let logger = logging::build(&config.logger_toml());
    logging::info!(logger, "starting node";
                   "address" => &config.server.address,
                   "workers" => config.server.worker_num);

    let (shared, queues) = LaborShared::new(config.server.worker_num as usize);

    let mut handles = Vec::new();
    for queue in queues {
        let worker_index = queue.worker;
        let shared = shared.clone();
        let cluster_config = config.cluster_config();
        let log = logger.new(logging::o!("worker" => worker_index));

        let handle = thread::Builder::new()
            .name(format!("worker-{}", worker_index))
            .spawn(move || {
                let mut reactor = Reactor::new(worker_index, &log).expect("Error creating reactor");
                reactor.set_labor(queue, shared).expect("Error wiring labor queue");

                let mut worker = Worker::new(reactor, LogHandler { log: log.clone() });
                if let Some(cluster_config) = cluster_config {
                    worker = worker.with_cluster(RedisCluster::new(
                        cluster_config,
                        CLUSTER_STEP_SEQ,
                        &log,
                    ));
                    worker.start_cluster();
                }

                run_worker(worker, &log);
            })
            .expect("Error spawning worker thread");
        handles.push(handle);
    }

    // The supervisor labor only accepts and transfers.
    let mut supervisor =
        Reactor::new(config.server.worker_num, &logger).expect("Error creating supervisor reactor");
    supervisor.set_labor_shared(shared);
    supervisor
        .listen(&config.server.address, config.accept_policy())
        .expect("Error binding listener");

    loop {
        if let Err(err) = supervisor.poll_once(Duration::from_secs(1)) {
            logging::error!(logger, "supervisor poll failed"; "error" => ?err);
            break;
        }
    }

    for handle in handles {
        let _ = handle.join();
    }
}

fn run_worker(mut worker: Worker<LogHandler>, log: &logging::Logger) {
    loop {
        let events = match worker.run_once(POLL_INTERVAL) {
            Ok(events) => events,
            Err(err) => {
                logging::error!(log, "worker poll failed"; "error" => ?err);
                return;
            }
        };

        for event in events {
            match event {
                Event::Accepted { channel, peer } => {
                    logging::info!(log, "downstream connected";
                                   "channel_id" => channel,
                                   "peer" => %peer);
                }
                // Minimal downstream surface: answer PING so load balancer
                // probes see a live worker.
                Event::Frame {
                    channel,
                    frame: Frame::Resp(value),
                    identify: None,
                    ..
                } => {
                    if is_ping(&value) {
                        let pong = Payload::RespValue(RespValue::status("PONG"));
                        let _ = worker.reactor_mut().send_on(channel, &pong, 0);
                    } else {
                        let err =
                            Payload::RespValue(RespValue::error("ERR unknown request"));
                        let _ = worker.reactor_mut().send_on(channel, &err, 0);
                    }
                }
                Event::ChannelClosed { channel, .. } => {
                    logging::debug!(log, "channel closed"; "channel_id" => channel);
                }
                _ => (),
            }
        }
    }
}

fn is_ping(value: &RespValue) -> bool {
    value
        .elements()
        .and_then(|elements| elements.first())
        .and_then(RespValue::text)
        .map(|cmd| cmd.eq_ignore_ascii_case("PING"))
        .unwrap_or(false)
}
