//! Test registration for the vmit integration suite.
//!
//! Tests register themselves with [`integration_test!`] or
//! [`libvirt_integration_test!`] and are collected by the runner binary.

// linkme places registrations in a dedicated link section.
#![allow(unsafe_code)]

#[doc(hidden)]
pub use linkme;

/// Label appended to tests that need a working libvirt host.
pub const LIBVIRT_INTEGRATION_TEST_LABEL: &str = "libvirt";

/// Environment variable enabling tests that create real VMs.
pub const LIBVIRT_TESTS_ENV: &str = "VMIT_LIBVIRT_TESTS";

/// A registered integration test.
pub struct IntegrationTest {
    pub name: &'static str,
    pub f: fn() -> color_eyre::Result<()>,
    /// Whether the test needs libvirt and is skipped unless enabled.
    pub libvirt: bool,
}

#[linkme::distributed_slice]
pub static INTEGRATION_TESTS: [IntegrationTest];

/// Whether tests that talk to libvirt should run.
pub fn libvirt_tests_enabled() -> bool {
    std::env::var(LIBVIRT_TESTS_ENV).is_ok_and(|v| v == "1")
}

/// Register a test function.
#[macro_export]
macro_rules! integration_test {
    ($f:ident) => {
        #[allow(unsafe_code)]
        const _: () = {
            use $crate::linkme;
            #[linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            #[linkme(crate = linkme)]
            static TEST: $crate::IntegrationTest = $crate::IntegrationTest {
                name: stringify!($f),
                f: $f,
                libvirt: false,
            };
        };
    };
}

/// Register a test function that provisions real VMs.
#[macro_export]
macro_rules! libvirt_integration_test {
    ($f:ident) => {
        #[allow(unsafe_code)]
        const _: () = {
            use $crate::linkme;
            #[linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            #[linkme(crate = linkme)]
            static TEST: $crate::IntegrationTest = $crate::IntegrationTest {
                name: stringify!($f),
                f: $f,
                libvirt: true,
            };
        };
    };
}
