//! Host facts (spec.md §6.1 "Host info source"): CPU model, logical core
//! count, memory status. Used once at run-open to populate `Run` and on
//! every tick by the Counter Reader (C1) to fill the memory fields of a
//! `SystemSample`.

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MemoryStatus {
    pub total_physical_mb: u64,
    pub available_physical_mb: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SystemDriveStatus {
    pub drive_type: String,
    pub free_mb: u64,
}

/// Blocking; may fail. Real impl wraps `GetSystemInfo`/`GlobalMemoryStatusEx`.
pub trait HostInfoSource: Send + Sync {
    fn cpu_model(&self) -> Option<String>;
    fn logical_core_count(&self) -> u32;
    fn memory_status(&self) -> Option<MemoryStatus>;
    fn system_drive_status(&self) -> Option<SystemDriveStatus>;
    fn uptime_seconds(&self) -> u64;
}

#[cfg(windows)]
pub use real::RealHostInfoSource;

#[cfg(windows)]
mod real {
    use super::{HostInfoSource, MemoryStatus, SystemDriveStatus};
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::ERROR_SUCCESS;
    use windows::Win32::Storage::FileSystem::{GetDiskFreeSpaceExW, GetDriveTypeW};
    use windows::Win32::System::Registry::{RegCloseKey, RegOpenKeyExW, RegQueryValueExW, HKEY_LOCAL_MACHINE, KEY_READ, REG_VALUE_TYPE};
    use windows::Win32::System::SystemInformation::{
        GetSystemInfo, GetTickCount64, GetWindowsDirectoryW, GlobalMemoryStatusEx, MEMORYSTATUSEX, SYSTEM_INFO,
    };

    #[derive(Debug, Default, Clone, Copy)]
    pub struct RealHostInfoSource;

    impl RealHostInfoSource {
        pub fn new() -> Self {
            Self
        }
    }

    impl HostInfoSource for RealHostInfoSource {
        fn cpu_model(&self) -> Option<String> {
            // No single Win32 call returns the brand string; it lives under
            // HKLM\HARDWARE\DESCRIPTION\System\CentralProcessor\0\ProcessorNameString.
            read_processor_name_from_registry()
        }

        fn logical_core_count(&self) -> u32 {
            let mut info = SYSTEM_INFO::default();
            unsafe { GetSystemInfo(&mut info) };
            info.dwNumberOfProcessors.max(1)
        }

        fn memory_status(&self) -> Option<MemoryStatus> {
            let mut status = MEMORYSTATUSEX {
                dwLength: std::mem::size_of::<MEMORYSTATUSEX>() as u32,
                ..Default::default()
            };
            unsafe { GlobalMemoryStatusEx(&mut status) }.ok()?;
            Some(MemoryStatus {
                total_physical_mb: status.ullTotalPhys / (1024 * 1024),
                available_physical_mb: status.ullAvailPhys / (1024 * 1024),
            })
        }

        fn system_drive_status(&self) -> Option<SystemDriveStatus> {
            let mut buf = [0u16; 260];
            let len = unsafe { GetWindowsDirectoryW(Some(&mut buf)) };
            if len == 0 || (len as usize) < 3 {
                return None;
            }
            let windows_dir = String::from_utf16_lossy(&buf[..len as usize]);
            let root = windows_dir.get(..3)?.to_string();
            let wide_root = to_wide(&root);

            let drive_type = unsafe { GetDriveTypeW(PCWSTR(wide_root.as_ptr())) };
            let drive_type = match drive_type {
                2 => "removable",
                3 => "fixed",
                4 => "remote",
                5 => "cdrom",
                6 => "ramdisk",
                _ => "unknown",
            }
            .to_string();

            let mut free_to_caller = 0u64;
            unsafe { GetDiskFreeSpaceExW(PCWSTR(wide_root.as_ptr()), Some(&mut free_to_caller as *mut u64), None, None) }.ok()?;

            Some(SystemDriveStatus {
                drive_type,
                free_mb: free_to_caller / (1024 * 1024),
            })
        }

        fn uptime_seconds(&self) -> u64 {
            unsafe { GetTickCount64() } / 1000
        }
    }

    /// Reads the processor brand string from the registry. Absence (missing
    /// key, access denied) degrades `Run::cpu_model` to empty, never to a
    /// propagated error (spec.md §4.1/§7 `ResourceUnavailable`).
    fn read_processor_name_from_registry() -> Option<String> {
        let subkey = to_wide("HARDWARE\\DESCRIPTION\\System\\CentralProcessor\\0");
        let value_name = to_wide("ProcessorNameString");

        let mut hkey = Default::default();
        let opened = unsafe { RegOpenKeyExW(HKEY_LOCAL_MACHINE, PCWSTR(subkey.as_ptr()), Some(0), KEY_READ, &mut hkey) };
        if opened != ERROR_SUCCESS {
            return None;
        }

        let mut buf_bytes: u32 = 0;
        let mut value_type = REG_VALUE_TYPE::default();
        let sized = unsafe {
            RegQueryValueExW(hkey, PCWSTR(value_name.as_ptr()), None, Some(&mut value_type), None, Some(&mut buf_bytes))
        };
        if sized != ERROR_SUCCESS || buf_bytes == 0 {
            unsafe { RegCloseKey(hkey) }.ok().ok();
            return None;
        }

        let mut buf = vec![0u8; buf_bytes as usize];
        let read = unsafe {
            RegQueryValueExW(
                hkey,
                PCWSTR(value_name.as_ptr()),
                None,
                Some(&mut value_type),
                Some(buf.as_mut_ptr()),
                Some(&mut buf_bytes),
            )
        };
        unsafe { RegCloseKey(hkey) }.ok().ok();
        if read != ERROR_SUCCESS {
            return None;
        }

        let wide: Vec<u16> = buf
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .take_while(|&c| c != 0)
            .collect();
        let name = String::from_utf16_lossy(&wide).trim().to_string();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }
}

/// Fixed fixtures for tests (teacher precedent: `MockFs`'s scripted content).
#[derive(Clone, Debug)]
pub struct MockHostInfoSource {
    pub cpu_model: Option<String>,
    pub logical_core_count: u32,
    pub memory_status: Option<MemoryStatus>,
    pub system_drive_status: Option<SystemDriveStatus>,
    pub uptime_seconds: u64,
}

impl Default for MockHostInfoSource {
    fn default() -> Self {
        Self {
            cpu_model: Some("Mock CPU".to_string()),
            logical_core_count: 4,
            memory_status: Some(MemoryStatus {
                total_physical_mb: 16384,
                available_physical_mb: 8192,
            }),
            system_drive_status: Some(SystemDriveStatus {
                drive_type: "fixed".to_string(),
                free_mb: 102_400,
            }),
            uptime_seconds: 3_600,
        }
    }
}

impl HostInfoSource for MockHostInfoSource {
    fn cpu_model(&self) -> Option<String> {
        self.cpu_model.clone()
    }

    fn logical_core_count(&self) -> u32 {
        self.logical_core_count
    }

    fn memory_status(&self) -> Option<MemoryStatus> {
        self.memory_status
    }

    fn system_drive_status(&self) -> Option<SystemDriveStatus> {
        self.system_drive_status.clone()
    }

    fn uptime_seconds(&self) -> u64 {
        self.uptime_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_host_info_returns_fixed_fixtures() {
        let source = MockHostInfoSource::default();
        assert_eq!(source.logical_core_count(), 4);
        assert!(source.memory_status().unwrap().total_physical_mb > 0);
    }
}
