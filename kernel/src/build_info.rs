// Build Metadata and Versioning
//
// Compile-time identity of the kernel core, printed in the boot banner and
// in every abort report so a serial log can be tied back to a build.
//
// Implementation details:
// - `define_build_meta!` expands into `pub const` string slices
// - Derived strings are assembled with `concat!`, no runtime formatting
// - The build date is spelled out by hand so builds stay reproducible

macro_rules! define_build_meta {
    ($kernel_name:literal, $version:literal, $milestone:literal, $build_date:literal) => {
        pub const KERNEL_NAME: &str = $kernel_name;
        pub const VERSION: &str = $version;
        pub const MILESTONE: &str = $milestone;
        pub const BUILD_DATE: &str = $build_date;

        pub const VERSION_TAG: &str = concat!($kernel_name, " v", $version);
        pub const BOOT_BANNER: &str = concat!(
            $kernel_name,
            " v",
            $version,
            " - ",
            $milestone,
            " (",
            $build_date,
            ")"
        );
    };
}

define_build_meta!(
    "Ferrite Kernel",
    "0.3.0",
    "Memory Core & SMP Scheduler",
    "2026-10-19"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_carries_name_version_and_date() {
        assert!(BOOT_BANNER.starts_with(VERSION_TAG));
        assert!(BOOT_BANNER.contains(MILESTONE));
        assert!(BOOT_BANNER.ends_with(concat!("(", "2026-10-19", ")")));
    }
}
