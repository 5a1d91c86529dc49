//! Transcoder command builders for the media fetch daemon

pub mod ffmpeg;

pub use ffmpeg::{
    build_audio_transcode, build_concat_demuxer, build_concat_protocol, build_cut,
    build_external_audio_mux, build_filter_trim, build_remux, build_to_mpegts, concat_list,
    run_ffmpeg, trim_concat_graph, MixMode, LOUDNORM_FILTER,
};
