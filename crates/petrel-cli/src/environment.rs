use petrel_spec::MarkerEnvironment;

/// Describe the current platform for marker evaluation.
///
/// Interpreter-specific attributes are left unset rather than guessed;
/// markers comparing against them evaluate to false.
pub(crate) fn current_environment() -> MarkerEnvironment {
    let os = std::env::consts::OS;
    MarkerEnvironment {
        os_name: Some(if os == "windows" { "nt" } else { "posix" }.to_string()),
        sys_platform: Some(
            match os {
                "windows" => "win32",
                "macos" => "darwin",
                other => other,
            }
            .to_string(),
        ),
        platform_system: Some(
            match os {
                "windows" => "Windows",
                "macos" => "Darwin",
                "linux" => "Linux",
                other => other,
            }
            .to_string(),
        ),
        platform_machine: Some(std::env::consts::ARCH.to_string()),
        ..MarkerEnvironment::default()
    }
}
