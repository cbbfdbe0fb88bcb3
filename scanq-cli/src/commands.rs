//! Subcommand implementations, generic over the log backend

use scanq_queue::{
    Dsn, Fields, FlatCodec, GroupStart, HandlerError, MemoryLog, QueueDefinition, QueueError,
    QueueLimit, Reaper, ReaperConfig, RedisConfig, RedisLog, RequestReply, RequestReplyConfig,
    StreamLog, StreamQueue, TaskMessage, WorkerPool,
};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Commands, WorkerArgs};

/// CLI records are plain field maps
type RecordQueue<L> = StreamQueue<Fields, FlatCodec, L>;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Queue limit of {limit} reached: {rejected} of {requested} records rejected")]
    Rejected {
        limit: usize,
        rejected: usize,
        requested: usize,
    },

    #[error("Output failed: {0}")]
    Output(#[from] serde_json::Error),
}

pub async fn run_command(
    definition: QueueDefinition,
    redis_url: Option<String>,
    memory: bool,
    command: Commands,
) -> Result<(), CliError> {
    if memory {
        info!(queue = %definition, "Using in-process log");
        let queue = RecordQueue::new(Arc::new(MemoryLog::new()), definition, FlatCodec);
        return execute(queue, command).await;
    }

    let mut config = RedisConfig::from_env()?;
    if let Some(url) = redis_url {
        config.url = Dsn::new(url);
    }
    info!(queue = %definition, redis = %config.url, "Connecting");
    let queue = RecordQueue::<RedisLog>::connect_redis(config, definition).await?;
    let result = execute(queue.clone(), command).await;
    queue.close().await;
    result
}

async fn execute<L: StreamLog>(queue: RecordQueue<L>, command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Ping => {
            queue.ping().await?;
            println!("PONG");
        }
        Commands::Publish {
            fields,
            priority,
            count,
            limit,
        } => {
            let record: Fields = fields.into_iter().collect();
            let gate = limit.map(|limit| {
                QueueLimit::new(limit).on_reject(|record: &Fields| {
                    warn!(fields = record.len(), "Record rejected by queue limit");
                })
            });

            let mut rejected = 0;
            for _ in 0..count {
                let published = match &gate {
                    Some(gate) => queue.publish_gated(gate, priority, &record).await?,
                    None => Some(queue.publish(priority, &record).await?),
                };
                match published {
                    Some(id) => println!("{}", id),
                    None => rejected += 1,
                }
            }
            if let Some(limit) = limit.filter(|_| rejected > 0) {
                return Err(CliError::Rejected {
                    limit,
                    rejected,
                    requested: count,
                });
            }
        }
        Commands::Consume {
            worker,
            workers,
            follow,
        } => consume(&queue, worker, workers, follow).await?,
        Commands::Reclaim {
            target,
            batch,
            min_idle,
            every,
        } => {
            let group = queue.group().to_string();
            match every {
                Some(every) => {
                    let token = cancel_on_ctrl_c();
                    let config = ReaperConfig::for_queue(&queue, min_idle)
                        .with_interval(every)
                        .with_max_batch(batch);
                    let reaper = Reaper::spawn(
                        queue.clone(),
                        group,
                        target,
                        config,
                        Arc::new(print_task),
                        token,
                    );
                    if let Err(e) = reaper.await {
                        warn!(error = %e, "Reaper task ended abnormally");
                    }
                }
                None => {
                    let claimed = queue
                        .reclaim_stale(&group, &target, batch, min_idle, &print_task)
                        .await?;
                    info!(group = %group, target = %target, claimed, "Reclaim finished");
                }
            }
        }
        Commands::Evict { batch, min_ttl } => {
            let min_ttl = min_ttl.unwrap_or(queue.definition().max_ttl);
            let evicted = queue.remove_stale(queue.group(), batch, min_ttl).await?;
            println!("{}", serde_json::json!({ "evicted": evicted }));
        }
        Commands::State => {
            let state = queue.get_state(queue.group()).await?;
            println!(
                "{}",
                serde_json::json!({
                    "stream": queue.stream(),
                    "group": queue.group(),
                    "total": state.total,
                    "queued": state.queued,
                    "stale": state.stale,
                })
            );
        }
        Commands::RpcServe {
            reply_stream,
            consumer,
            block,
        } => {
            let config = RequestReplyConfig::default()
                .with_consumer(consumer.clone())
                .with_block(block);
            let rpc = request_reply(&queue, reply_stream, config);
            rpc.declare().await?;

            let echo = move |mut request: Fields| {
                request.insert("served_by".to_string(), consumer.clone());
                async move { Ok::<Fields, HandlerError>(request) }
            };
            rpc.serve_until(&echo, &cancel_on_ctrl_c()).await?;
        }
        Commands::RpcCall {
            reply_stream,
            fields,
            timeout,
        } => {
            let rpc = request_reply(&queue, reply_stream, RequestReplyConfig::default());
            let request: Fields = fields.into_iter().collect();
            let reply = rpc.request_reply_timeout(&request, timeout).await?;
            println!("{}", serde_json::to_string(&reply)?);
        }
    }
    Ok(())
}

async fn consume<L: StreamLog>(
    queue: &RecordQueue<L>,
    worker: WorkerArgs,
    workers: Option<usize>,
    follow: bool,
) -> Result<(), CliError> {
    let group = worker.group.unwrap_or_else(|| queue.group().to_string());
    queue
        .log()
        .create_group(queue.stream(), &group, GroupStart::Beginning)
        .await?;

    if let Some(size) = workers {
        let pool = WorkerPool::spawn(
            queue,
            &group,
            &worker.consumer,
            size,
            worker.block,
            Arc::new(print_task),
        );
        wait_for_ctrl_c().await;
        for (consumer, result) in pool.shutdown().await {
            if let Err(e) = result {
                warn!(consumer = %consumer, error = %e, "Worker stopped with error");
            }
        }
        return Ok(());
    }

    if follow {
        queue
            .subscribe_until(
                &group,
                &worker.consumer,
                worker.block,
                &print_task,
                &cancel_on_ctrl_c(),
            )
            .await?;
        return Ok(());
    }

    match queue
        .subscribe(&group, &worker.consumer, worker.block, &print_task)
        .await
    {
        Err(e) if e.is_timeout() => {
            info!(group = %group, consumer = %worker.consumer, "Stream drained");
            Ok(())
        }
        Err(e) => Err(e.into()),
        Ok(()) => Ok(()),
    }
}

/// Request stream is the descriptor's stream; replies share its group name
fn request_reply<L: StreamLog>(
    queue: &RecordQueue<L>,
    reply_stream: String,
    config: RequestReplyConfig,
) -> RequestReply<Fields, Fields, FlatCodec, L> {
    let definition = queue.definition();
    let replies = queue.with_definition(
        QueueDefinition::new(reply_stream, definition.group.clone())
            .with_max_len(definition.max_len),
    );
    RequestReply::new(
        queue.clone(),
        replies,
        config.with_group(definition.group.clone()),
    )
}

async fn print_task(task: TaskMessage<Fields>) -> Result<(), HandlerError> {
    let line = serde_json::json!({
        "id": task.id,
        "stream": task.stream,
        "retry_count": task.retry_count,
        "priority": task.priority.as_u8(),
        "fields": task.payload,
    });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl-C, stopping");
    } else {
        info!("Interrupt received, shutting down");
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_ctrl_c().await;
        trigger.cancel();
    });
    token
}
