pub mod recording_backend;
pub mod smoke;

#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::smoke;

            macro_rules! smoke_test {
                ($name:ident) => {
                    #[test]
                    fn $name() {
                        let backend = ($backend_ctor)();
                        smoke::$name(&backend);
                    }
                };
            }

            smoke_test!(average_pool_matches_expected);
            smoke_test!(quantized_average_pool_matches_expected);
            smoke_test!(quantized_average_pool_rounds_half_away_from_zero);
            smoke_test!(quantized_data_on_float_graph_is_rejected);
            smoke_test!(max_pool_with_padding_matches_expected);
            smoke_test!(fully_connected_matches_expected);
            smoke_test!(convolution_with_padding_matches_expected);
            smoke_test!(fused_convolution_matches_unfused);
            smoke_test!(broadcast_multiplication_matches_expected);
            smoke_test!(softmax_rows_sum_to_one);
            smoke_test!(reshape_preserves_values);
            smoke_test!(profiling_is_transparent);
            smoke_test!(repeated_runs_are_stable);
        }
    };
}
