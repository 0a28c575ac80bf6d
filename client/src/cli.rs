use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{BatchInfo, BatchRequest, FinalOutput, NodeMetrics, TaskSpec, TaskView};
use reqwest::{Client, StatusCode};

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para enviar batches de inferencia al coordinador")]
struct Cli {
    /// URL base de la API HTTP del coordinador
    #[arg(long, env = "FLEET_URL", default_value = "http://localhost:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un batch. Cada PAYLOAD es un JSON; con --file se lee un BatchRequest completo.
    Submit {
        #[arg(long, default_value = "batch")]
        name: String,

        #[arg(long, conflicts_with = "payloads")]
        file: Option<PathBuf>,

        /// Timeout de agregación en segundos
        #[arg(long)]
        timeout: Option<u64>,

        #[arg(value_name = "PAYLOAD")]
        payloads: Vec<String>,
    },
    /// Consulta el estado de un batch
    Status {
        #[arg(value_name = "BATCH_ID")]
        id: String,
    },
    /// Muestra la salida final de un batch
    Results {
        #[arg(value_name = "BATCH_ID")]
        id: String,
    },
    /// Estado de una tarea
    Task {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    Nodes,
}

/// Arma el batch a partir de payloads sueltos en la línea de comandos.
fn build_request(name: String, payloads: &[String], timeout_secs: Option<u64>) -> Result<BatchRequest> {
    if payloads.is_empty() {
        bail!("no hay payloads: pasá al menos uno o usá --file");
    }
    let tasks = payloads
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let payload = serde_json::from_str(raw)
                .with_context(|| format!("payload {} no es JSON válido", i + 1))?;
            Ok(TaskSpec {
                id: None,
                payload,
                weight: None,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(BatchRequest {
        name,
        tasks,
        timeout_secs,
    })
}

fn print_batch(info: &BatchInfo) {
    println!("Batch:");
    println!("  id: {}", info.id);
    println!("  nombre: {}", info.name);
    println!("  estado: {:?}", info.status);
    println!(
        "  tareas: total={}, completadas={}, fallidas={}, faltantes={}",
        info.total_tasks, info.completed_tasks, info.failed_tasks, info.missing_tasks
    );

    let done = info.completed_tasks + info.failed_tasks + info.missing_tasks;
    if info.total_tasks > 0 {
        let pct = (done as f64 / info.total_tasks as f64) * 100.0;
        println!("  progreso: {:.1}%", pct);
    }
    println!("  submitted_at: {}", info.submitted_at);
    if let Some(ref finished) = info.finished_at {
        println!("  finalizado: {}", finished);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Submit {
            name,
            file,
            timeout,
            payloads,
        } => {
            let req = match file {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("no se pudo leer {}", path.display()))?;
                    let mut req: BatchRequest = serde_json::from_str(&raw)
                        .with_context(|| format!("{} no es un batch válido", path.display()))?;
                    if timeout.is_some() {
                        req.timeout_secs = timeout;
                    }
                    req
                }
                None => build_request(name, &payloads, timeout)?,
            };

            let url = format!("{}/api/v1/batches", base_url);
            let resp = client.post(&url).json(&req).send().await?;
            if resp.status() == StatusCode::CREATED {
                let info: BatchInfo = resp.json().await?;
                println!("Batch creado con {} tareas", info.total_tasks);
                print_batch(&info);
            } else {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!("el coordinador rechazó el batch ({}): {}", status, body);
            }
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/batches/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let info: BatchInfo = resp.json().await?;
                print_batch(&info);
            } else {
                println!("Error: batch no encontrado (status {})", resp.status());
            }
        }

        Commands::Results { id } => {
            let url = format!("{}/api/v1/batches/{}/results", base_url, id);
            let resp = client.get(&url).send().await?;
            match resp.status() {
                s if s.is_success() => {
                    let output: FinalOutput = resp.json().await?;
                    println!("Resultados del batch {}:", output.batch_id);
                    println!("  completo: {}", output.complete);
                    println!("  fold: {}", output.fold);
                    println!("  ok: {}", output.succeeded.len());
                    for (task_id, reason) in &output.failed {
                        println!("  falló {}: {}", task_id, reason);
                    }
                    if !output.missing.is_empty() {
                        println!("  faltantes: {}", output.missing.join(", "));
                    }
                    println!("{}", serde_json::to_string_pretty(&output.value)?);
                }
                StatusCode::CONFLICT => println!("El batch {id} sigue corriendo"),
                s => println!("No hay resultados para el batch {id} (status {s})"),
            }
        }

        Commands::Task { id } => {
            let url = format!("{}/api/v1/tasks/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let task: TaskView = resp.json().await?;
                println!("Tarea {}", task.task_id);
                if let Some(ref batch) = task.batch_id {
                    println!("  batch   : {}", batch);
                }
                println!("  estado  : {:?}", task.status);
                println!("  intentos: {}", task.attempt);
                println!("  peso    : {}", task.weight);
                match task.owner {
                    Some(ref owner) => println!("  nodo    : {}", owner),
                    None => println!("  nodo    : (sin asignar)"),
                }
                if let Some(outcome) = task.outcome {
                    println!("  resultado: {:?}", outcome);
                }
            } else {
                println!("No se encontró la tarea {id} (status {})", resp.status());
            }
        }

        Commands::Nodes => {
            let url = format!("{}/api/v1/nodes", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let nodes: Vec<NodeMetrics> = resp.json().await?;
                if nodes.is_empty() {
                    println!("No hay nodos registrados.");
                }
                for n in nodes {
                    println!("Nodo {}", n.node_id);
                    println!("  host           : {}", n.hostname);
                    println!("  estado         : {:?}", n.status);
                    println!("  carga          : {:.2}", n.load);
                    println!("  last_heartbeat : {} s ago", n.last_heartbeat_secs_ago);
                    println!(
                        "  tareas         : asignadas={}, ok={}, fallidas={}",
                        n.tasks_assigned, n.tasks_completed, n.tasks_failed
                    );
                    if !n.assigned_tasks.is_empty() {
                        println!("  en curso       : {}", n.assigned_tasks.join(", "));
                    }
                    if let Some(cpu) = n.last_cpu_percent {
                        println!("  cpu_percent    : {:.1}%", cpu);
                    }
                    if let Some(mem) = n.last_mem_bytes {
                        println!("  mem_bytes      : {}", mem);
                    }
                    println!();
                }
            } else {
                println!("Error consultando /api/v1/nodes (status {})", resp.status());
            }
        }
    }

    Ok(())
}
