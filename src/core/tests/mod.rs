mod harvester_tests;
mod stream_tests;
