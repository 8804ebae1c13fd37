//! Elevation detection and relaunch

use crate::exec::{CommandSpec, ExecError, run_command};
use crate::template::filters::ps_quote;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("elevated relaunch is only supported on Windows")]
    Unsupported,

    #[error("could not locate the current executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error("failed to request elevation: {0}")]
    Launch(#[from] ExecError),

    #[error("elevation was declined or failed (exit code {exit_code}): {message}")]
    Declined { exit_code: i32, message: String },
}

/// Whether the current process runs with administrator rights
pub fn is_elevated() -> bool {
    platform::is_elevated()
}

/// Name of the interactive user
pub fn current_user() -> String {
    ["USERNAME", "USER"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// PowerShell that starts `exe` elevated with `args`
pub fn elevation_script(exe: &str, args: &[String]) -> String {
    let mut script = format!("Start-Process -FilePath {} -Verb RunAs", ps_quote(exe));
    if !args.is_empty() {
        let list = args
            .iter()
            .map(|a| ps_quote(&quote_for_argument_list(a)))
            .collect::<Vec<_>>()
            .join(",");
        script.push_str(&format!(" -ArgumentList @({list})"));
    }
    script
}

// Start-Process joins ArgumentList with spaces, so entries with whitespace
// need their own double quotes to survive as one argument.
fn quote_for_argument_list(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(char::is_whitespace) {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Start a new elevated instance of this program with `args`
pub async fn relaunch_elevated(args: &[String]) -> Result<(), AdminError> {
    if !cfg!(windows) {
        return Err(AdminError::Unsupported);
    }

    let exe = std::env::current_exe().map_err(AdminError::CurrentExe)?;
    let script = elevation_script(&exe.to_string_lossy(), args);
    info!(exe = %exe.display(), args = ?args, "requesting elevation");

    let result = run_command(&CommandSpec::powershell(script).with_timeout(120.0), false).await?;
    if result.succeeded() {
        Ok(())
    } else {
        Err(AdminError::Declined {
            exit_code: result.exit_code,
            message: result.display_output(),
        })
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::c_void;

    #[repr(C)]
    struct SidIdentifierAuthority {
        value: [u8; 6],
    }

    const SECURITY_NT_AUTHORITY: [u8; 6] = [0, 0, 0, 0, 0, 5];
    const SECURITY_BUILTIN_DOMAIN_RID: u32 = 0x20;
    const DOMAIN_ALIAS_RID_ADMINS: u32 = 0x220;

    #[link(name = "advapi32")]
    unsafe extern "system" {
        #[allow(clippy::too_many_arguments)]
        fn AllocateAndInitializeSid(
            authority: *const SidIdentifierAuthority,
            sub_authority_count: u8,
            sub0: u32,
            sub1: u32,
            sub2: u32,
            sub3: u32,
            sub4: u32,
            sub5: u32,
            sub6: u32,
            sub7: u32,
            sid: *mut *mut c_void,
        ) -> i32;
        fn CheckTokenMembership(token: *mut c_void, sid: *mut c_void, is_member: *mut i32) -> i32;
        fn FreeSid(sid: *mut c_void) -> *mut c_void;
    }

    pub fn is_elevated() -> bool {
        let authority = SidIdentifierAuthority {
            value: SECURITY_NT_AUTHORITY,
        };
        let mut sid: *mut c_void = std::ptr::null_mut();

        // SAFETY: all pointers are valid for the duration of the calls and the
        // SID allocated here is released with FreeSid.
        unsafe {
            if AllocateAndInitializeSid(
                &authority,
                2,
                SECURITY_BUILTIN_DOMAIN_RID,
                DOMAIN_ALIAS_RID_ADMINS,
                0,
                0,
                0,
                0,
                0,
                0,
                &mut sid,
            ) == 0
            {
                return false;
            }
            let mut is_member: i32 = 0;
            let checked = CheckTokenMembership(std::ptr::null_mut(), sid, &mut is_member);
            FreeSid(sid);
            checked != 0 && is_member != 0
        }
    }
}

#[cfg(not(windows))]
mod platform {
    pub fn is_elevated() -> bool {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| effective_uid(&status))
            .map(|uid| uid == 0)
            .unwrap_or(false)
    }

    /// Effective uid from the `Uid:` line (real, effective, saved, fs)
    pub(super) fn effective_uid(status: &str) -> Option<u32> {
        status
            .lines()
            .find_map(|line| line.strip_prefix("Uid:"))
            .and_then(|ids| ids.split_whitespace().nth(1))
            .and_then(|uid| uid.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_user_not_empty() {
        assert!(!current_user().is_empty());
    }

    #[test]
    fn test_is_elevated_does_not_panic() {
        let _ = is_elevated();
    }

    #[cfg(not(windows))]
    #[test]
    fn test_effective_uid_parse() {
        let status = "Name:\tsanity\nUid:\t1000\t0\t1000\t1000\nGid:\t1000\t1000\t1000\t1000\n";
        assert_eq!(platform::effective_uid(status), Some(0));
        assert_eq!(platform::effective_uid("Name:\tx\n"), None);
    }

    #[test]
    fn test_elevation_script() {
        let script = elevation_script(
            r"C:\Tools\sanity.exe",
            &["ports".into(), "kill".into(), "4242".into()],
        );
        assert_eq!(
            script,
            r"Start-Process -FilePath 'C:\Tools\sanity.exe' -Verb RunAs -ArgumentList @('ports','kill','4242')"
        );

        let script = elevation_script("sanity.exe", &["run".into(), "it's here".into()]);
        assert!(script.ends_with(r#"-ArgumentList @('run','"it''s here"')"#));

        let script = elevation_script("sanity.exe", &[]);
        assert!(!script.contains("ArgumentList"));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_relaunch_unsupported() {
        let err = relaunch_elevated(&[]).await.unwrap_err();
        assert!(matches!(err, AdminError::Unsupported));
    }
}
