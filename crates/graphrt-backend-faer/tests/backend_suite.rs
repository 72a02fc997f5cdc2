use std::sync::Arc;

use graphrt_backend_faer::FaerBackend;

graphrt_backend_tests::define_backend_tests!(faer_suite, || Arc::new(FaerBackend::with_threads(4)));

graphrt_backend_tests::define_backend_tests!(faer_serial_suite, || {
    Arc::new(FaerBackend::with_threads(1))
});
