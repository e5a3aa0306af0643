pub mod growth_rates;
pub mod plate_reader;
pub mod qpcr;
pub mod sgrna_counts;
