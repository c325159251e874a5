//! # Vitals Station
//!
//! Lê o dispositivo de sinais vitais pela porta serial, mostra as leituras
//! no terminal e registra a sessão no backend.
//!
//! ## Uso
//! ```bash
//! vitals_station ports                          # Lista portas seriais
//! vitals_station run --patient 42               # Monitora (primeira porta USB)
//! vitals_station run --patient 42 --port COM3   # Porta explícita
//! vitals_station sessions --patient 42          # Histórico do paciente
//! ```

mod http_store;
mod serial;

use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, bounded, select};
use http_store::HttpSessionStore;
use serial::SerialTransport;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use vitals_core::config::AppConfig;
use vitals_core::store::{SessionStore, sort_patient_history};
use vitals_core::transport::Transport;
use vitals_core::{Monitor, MonitorEvent, Reading, Session};

#[derive(Parser)]
#[command(name = "vitals_station", version, about = "Estação de monitoramento de sinais vitais")]
struct Cli {
    /// Caminho do config.toml (padrão: ao lado do executável)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lista as portas seriais disponíveis
    Ports,
    /// Cria a sessão, conecta ao dispositivo e monitora
    Run {
        /// Identificador do paciente
        #[arg(long)]
        patient: String,
        /// Porta serial (sobrepõe o config)
        #[arg(long)]
        port: Option<String>,
    },
    /// Lista sessões registradas no backend
    Sessions {
        /// Filtra por paciente
        #[arg(long)]
        patient: Option<String>,
    },
}

fn main() -> ExitCode {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // ── Carregar config ──
    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path);

    // Salva config padrão se não existir
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!("Config inválida: {problem}");
        }
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Ports => list_ports(&config),
        Command::Run { patient, port } => run(&config, &patient, port),
        Command::Sessions { patient } => list_sessions(&config, patient.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}

// ──────────────────────────────────────────────
// Subcomandos
// ──────────────────────────────────────────────

fn list_ports(config: &AppConfig) -> Result<(), String> {
    let transport = SerialTransport::new(config.serial.port.clone());
    let ports = transport.list_authorized().map_err(|e| e.to_string())?;
    if ports.is_empty() {
        println!("Nenhuma porta serial encontrada");
        return Ok(());
    }
    for port in ports {
        println!("  {port}  [{:?}]", port.kind);
    }
    Ok(())
}

fn list_sessions(config: &AppConfig, patient: Option<&str>) -> Result<(), String> {
    let store = HttpSessionStore::new(&config.store).map_err(|e| e.to_string())?;
    let sessions = match patient {
        Some(id) => sort_patient_history(store.list_by_patient(id).map_err(|e| e.to_string())?),
        None => store.list_all().map_err(|e| e.to_string())?,
    };
    if sessions.is_empty() {
        println!("Nenhuma sessão registrada");
    }
    for session in &sessions {
        print_session(session);
    }
    Ok(())
}

fn print_session(session: &Session) {
    let ended = session
        .ended_at
        .map(|t| t.format("%d/%m/%Y %H:%M:%S").to_string())
        .unwrap_or_else(|| "em andamento".into());
    println!(
        "  {}  paciente {}  {} → {}  ({} registros)",
        session.id,
        session.patient_id,
        session.started_at.format("%d/%m/%Y %H:%M:%S"),
        ended,
        session.records.len()
    );
}

fn print_reading(reading: &Reading) {
    println!(
        "  {}  ♥ {:>5.1} bpm | SpO₂ {:>5.1}% | Pulmão {:>4.2} L",
        reading.timestamp.format("%H:%M:%S%.3f"),
        reading.pulse,
        reading.oxygen_saturation,
        reading.lung_capacity
    );
}

fn run(config: &AppConfig, patient: &str, port: Option<String>) -> Result<(), String> {
    let preferred = port.unwrap_or_else(|| config.serial.port.clone());
    let transport = Arc::new(SerialTransport::new(preferred));
    let store = Arc::new(HttpSessionStore::new(&config.store).map_err(|e| e.to_string())?);
    let monitor = Monitor::new(transport, store, config);
    let events = monitor.subscribe();

    let session = monitor.create_session(patient).map_err(|e| e.to_string())?;
    let device = monitor.request_device().map_err(|e| e.to_string())?;
    monitor.connect().map_err(|e| e.to_string())?;

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   ♥ VITALS STATION – CONECTADO");
    println!("══════════════════════════════════════════════");
    println!("  Paciente:  {patient}");
    println!("  Sessão:    {}", session.id);
    println!("  Porta:     {device} @ {} baud", config.serial.baud_rate);
    println!("  Backend:   {}", config.store.base_url);
    println!("  Comandos:  start | stop | status | connect | disconnect | reset | quit");
    println!("══════════════════════════════════════════════");
    println!();

    let commands = spawn_console_thread().map_err(|e| format!("Falha ao criar thread de console: {e}"))?;
    event_loop(&monitor, &events, &commands);

    if monitor.is_monitoring() {
        if let Err(e) = monitor.stop_monitoring() {
            warn!("Falha ao finalizar monitoramento: {e}");
        }
    }
    if let Err(e) = monitor.disconnect() {
        warn!("Falha ao desconectar: {e}");
    }
    info!("Encerrado");
    Ok(())
}

// ──────────────────────────────────────────────
// Console
// ──────────────────────────────────────────────

/// Lê comandos do stdin em thread própria. O channel fecha no EOF.
fn spawn_console_thread() -> std::io::Result<Receiver<String>> {
    let (tx, rx) = bounded::<String>(16);
    std::thread::Builder::new()
        .name("console-input".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line.trim().to_lowercase()).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

fn event_loop(monitor: &Monitor, events: &Receiver<MonitorEvent>, commands: &Receiver<String>) {
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(MonitorEvent::ReadingAccepted(reading)) => print_reading(&reading),
                Ok(MonitorEvent::StartedFromDevice) => println!("▶ Monitoramento iniciado pelo dispositivo"),
                Ok(MonitorEvent::ConnectionLost) => println!("✖ Dispositivo desconectado (use 'connect')"),
                Ok(MonitorEvent::ReadFailed(message)) => println!("✖ {message} (use 'connect')"),
                Err(_) => return,
            },
            recv(commands) -> command => {
                let Ok(command) = command else { return };
                if !handle_command(monitor, &command) {
                    return;
                }
            },
        }
    }
}

/// Executa um comando do operador. Retorna `false` para sair.
fn handle_command(monitor: &Monitor, command: &str) -> bool {
    let result = match command {
        "" => Ok(()),
        "start" => monitor.start_monitoring(),
        "stop" => monitor.stop_monitoring(),
        "connect" => monitor.connect(),
        "disconnect" => monitor.disconnect(),
        "reset" => monitor.reset(),
        "status" => {
            print_status(monitor);
            Ok(())
        }
        "quit" | "exit" => return false,
        other => {
            println!("Comando desconhecido: {other}");
            Ok(())
        }
    };
    if let Err(e) = result {
        println!("✖ {e}");
    }
    true
}

fn print_status(monitor: &Monitor) {
    let status = monitor.status();
    println!("  Fase:       {}", status.phase);
    println!("  Conectado:  {}", if status.connected { "sim" } else { "não" });
    if status.monitoring {
        let origin = if status.started_from_device { "dispositivo" } else { "operador" };
        println!("  Iniciado:   pelo {origin}");
    }
    if let Some(device) = &status.device {
        println!("  Porta:      {device}");
    }
    match &status.session {
        Some(session) => print_session(session),
        None => println!("  Sem sessão"),
    }
    println!("  Leituras:   {}", status.readings);
    if let Some(latest) = &status.latest {
        print_reading(latest);
    }
    if let Some(err) = &status.last_error {
        println!("  Último erro: {err}");
    }
}
