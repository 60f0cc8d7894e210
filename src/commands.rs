//! Frontend-facing commands. Errors are flattened to strings for display.

use std::path::Path;

use crate::app::AppContext;
use crate::connection::Payload;
use crate::device::{ConnectionStatus, TransportKind};
use crate::repl::{FsSnapshot, VersionInfo};
use crate::serial::{matches_any, NativeSerialHost, SerialDeviceInfo};

/// List XRP controllers currently attached to this machine
pub async fn list_devices(ctx: &AppContext) -> Result<Vec<SerialDeviceInfo>, String> {
    let devices = NativeSerialHost::scan_devices()
        .await
        .map_err(|e| format!("Failed to discover devices: {}", e))?;
    Ok(devices
        .into_iter()
        .filter(|info| matches_any(&ctx.config().device_filters, info))
        .collect())
}

/// Previously authorized XRP ports
pub async fn get_authorized_devices(ctx: &AppContext) -> Result<Vec<SerialDeviceInfo>, String> {
    ctx.connections()
        .authorized_devices()
        .await
        .map_err(|e| format!("Failed to get authorized devices: {}", e))
}

/// Connect using the named transport ("usb" or "bluetooth")
pub async fn connect_device(ctx: &AppContext, transport: &str) -> Result<ConnectionStatus, String> {
    let kind: TransportKind = transport
        .parse()
        .map_err(|e| format!("Invalid transport: {}", e))?;

    ctx.connections()
        .connect(kind)
        .await
        .map_err(|e| format!("Failed to connect to device: {}", e))?;
    Ok(ctx.connections().status().await)
}

/// Disconnect from the currently connected device
pub async fn disconnect_device(ctx: &AppContext) -> Result<(), String> {
    ctx.connections()
        .disconnect()
        .await
        .map_err(|e| format!("Failed to disconnect device: {}", e))
}

/// Send terminal input to the device
pub async fn write_to_device(ctx: &AppContext, data: String) -> Result<(), String> {
    ctx.connections()
        .write(Payload::Text(&data))
        .await
        .map_err(|e| format!("Failed to write to device: {}", e))
}

pub async fn write_bytes_to_device(ctx: &AppContext, data: Vec<u8>) -> Result<(), String> {
    ctx.connections()
        .write(Payload::Bytes(&data))
        .await
        .map_err(|e| format!("Failed to write to device: {}", e))
}

pub async fn get_connection_status(ctx: &AppContext) -> Result<ConnectionStatus, String> {
    Ok(ctx.connections().status().await)
}

/// Interrupt the running program and return to the prompt
pub async fn stop_program(ctx: &AppContext) -> Result<(), String> {
    ctx.connections()
        .get_to_repl()
        .await
        .map_err(|e| format!("Failed to stop program: {}", e))
}

pub async fn is_busy(ctx: &AppContext) -> Result<bool, String> {
    Ok(ctx.connections().is_busy().await)
}

/// Battery voltage in volts
pub async fn get_battery_voltage(ctx: &AppContext) -> Result<f64, String> {
    ctx.connections()
        .battery_voltage()
        .await
        .map_err(|e| format!("Failed to read battery voltage: {}", e))
}

pub async fn get_version_info(ctx: &AppContext) -> Result<VersionInfo, String> {
    ctx.connections()
        .version_info()
        .await
        .map_err(|e| format!("Failed to read version info: {}", e))
}

/// Files on the device and its free space
pub async fn get_fs_tree(ctx: &AppContext) -> Result<FsSnapshot, String> {
    ctx.connections()
        .fs_tree()
        .await
        .map_err(|e| format!("Failed to list device files: {}", e))
}

/// Run a program and wait until it ends or is stopped
pub async fn run_program(ctx: &AppContext, name: &str, source: &str) -> Result<(), String> {
    ctx.connections()
        .run_program(name, source)
        .await
        .map_err(|e| format!("Failed to run {}: {}", name, e))
}

/// Remember the ports granted in this session
pub async fn save_authorized_ports(ctx: &AppContext, path: &Path) -> Result<Vec<String>, String> {
    ctx.save_authorized_ports(path)
        .await
        .map(|config| config.authorized_ports)
        .map_err(|e| format!("Failed to save configuration: {}", e))
}
