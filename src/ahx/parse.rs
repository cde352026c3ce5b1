use std::io::Read;

use arrayvec::ArrayVec;
use log::{debug, warn};

use super::flags::SongFlags;
use super::*;

impl AhxModule {
    /// Attempts to parse an AHX module from the given bytes.
    ///
    /// The module starts with a `THX` signature followed by the revision
    /// byte (0 or 1); anything else, and any truncated module, yields
    /// [AhxError::NotAnAhx]. Recoverable oddities (restart position past the
    /// song end, missing instruments, over-long rows) are coerced the way the
    /// AHX tracker coerces them, with a logged warning.
    pub fn parse(data: &[u8]) -> Result<AhxModule, AhxError> {
        let mut rd = data;

        let mut ident = [0u8; 4];
        read_exact(&mut rd, &mut ident)?;
        let revision = ident[3];
        if &ident[0..3] != b"THX" || revision > 1 {
            return Err(AhxError::NotAnAhx);
        }

        // two reserved bytes precede the flag word
        read_word(&mut rd)?;

        let flags = SongFlags::from_bits_retain(read_word(&mut rd)?);
        let song_length = flags.song_length();
        let mut restart_pos = read_word(&mut rd)?;
        let track_length = read_byte(&mut rd)?;
        let highest_track = read_byte(&mut rd)?;
        let num_instruments = read_byte(&mut rd)?;
        let num_subsongs = read_byte(&mut rd)?;

        if restart_pos >= song_length {
            warn!("restart position {} past song end {}, using 0", restart_pos, song_length);
            restart_pos = 0;
        }

        let mut subsongs = vec![0u16; num_subsongs as usize].into_boxed_slice();
        for entry in subsongs.iter_mut() {
            *entry = read_word(&mut rd)?;
        }

        let mut positions = vec![0u8; (song_length as usize) << 3].into_boxed_slice();
        read_exact(&mut rd, &mut positions)?;

        // every track gets a full 64-row slot; short tracks stay zero-padded
        let num_tracks = highest_track as usize + 1;
        let mut tracks = vec![0u8; num_tracks * TRACK_ROWS * TRACK_ROW_BYTES].into_boxed_slice();

        let stored_rows = if track_length as usize > TRACK_ROWS {
            warn!("track length {} exceeds {} rows, extra rows ignored", track_length, TRACK_ROWS);
            TRACK_ROWS
        } else {
            track_length as usize
        };
        let track_bytes = track_length as usize * TRACK_ROW_BYTES;
        let first_track = usize::from(flags.track_zero_empty());
        for track in first_track..num_tracks {
            let mut row_data = vec![0u8; track_bytes];
            read_exact(&mut rd, &mut row_data)?;
            let offset = track * TRACK_ROWS * TRACK_ROW_BYTES;
            let stored = stored_rows * TRACK_ROW_BYTES;
            tracks[offset..offset + stored].copy_from_slice(&row_data[..stored]);
        }

        let mut instruments: ArrayVec<Instrument, MAX_INSTRUMENTS> = ArrayVec::new();
        for index in 0..num_instruments {
            let instrument = read_instrument(&mut rd)?;
            if instruments.try_push(instrument).is_err() {
                warn!("instrument {} past the limit of {}, dropped", index + 1, MAX_INSTRUMENTS);
            }
        }

        let name = read_name(&mut rd);

        let mut module = AhxModule {
            name,
            revision,
            song_length,
            restart_pos,
            track_length,
            highest_track,
            subsongs,
            positions,
            tracks,
            instruments,
            cia_period: flags.cia_period(),
            empty_instrument: Instrument::empty(),
        };

        if revision == 0 {
            strip_filter_commands(&mut module);
        }

        debug!(
            "loaded {}: {} positions, {} tracks of {} rows, {} instruments, {} subsongs",
            module,
            module.song_length,
            module.highest_track as u16 + 1,
            module.track_length,
            module.instruments.len(),
            module.subsongs.len()
        );

        Ok(module)
    }
}

fn read_instrument(rd: &mut &[u8]) -> Result<Instrument, AhxError> {
    let mut header = [0u8; 22];
    read_exact(rd, &mut header)?;

    let perf_length = header[21];
    let mut perf_list = vec![0u8; PERF_LIST_BYTES].into_boxed_slice();
    let stored = perf_length as usize * PERF_ENTRY_BYTES;
    read_exact(rd, &mut perf_list[..stored])?;

    Ok(Instrument {
        volume: header[0],
        filter_speed_wavelength: header[1],
        a_frames: header[2],
        a_volume: header[3],
        d_frames: header[4],
        d_volume: header[5],
        s_frames: header[6],
        r_frames: header[7],
        r_volume: header[8],
        filter_lower_limit: header[12],
        vibrato_delay: header[13],
        vibrato_depth: header[14],
        vibrato_speed: header[15],
        square_lower_limit: header[16],
        square_upper_limit: header[17],
        square_speed: header[18],
        filter_upper_limit: header[19],
        perf_speed: header[20],
        perf_length,
        perf_list,
    })
}

/// Reads the NUL-terminated song name, at most 255 bytes. A missing
/// terminator at the end of the file just ends the name.
fn read_name(rd: &mut &[u8]) -> String {
    let end = rd.iter().position(|&b| b == 0).unwrap_or(rd.len());
    let name = &rd[..end.min(255)];
    String::from_utf8_lossy(name).into_owned()
}

/// Revision-0 modules predate the filter: the tracker clears the override
/// command in every row and the parameters of performance commands 0 and 4.
fn strip_filter_commands(module: &mut AhxModule) {
    for track in 0..=module.highest_track as usize {
        for row in 0..(module.track_length as usize).min(TRACK_ROWS) {
            let offset = (track * TRACK_ROWS + row) * TRACK_ROW_BYTES;
            if module.tracks[offset + 1] & 0x0F == 4 {
                module.tracks[offset + 1] &= 0xF0;
                module.tracks[offset + 2] = 0;
            }
        }
    }

    for instrument in module.instruments.iter_mut() {
        for entry in 0..instrument.perf_length as usize {
            let offset = entry * PERF_ENTRY_BYTES;
            let cmd1 = (instrument.perf_list[offset] >> 2) & 7;
            if cmd1 == 0 || cmd1 == 4 {
                instrument.perf_list[offset + 2] = 0;
            }
            let cmd2 = (instrument.perf_list[offset] >> 5) & 7;
            if cmd2 == 0 || cmd2 == 4 {
                instrument.perf_list[offset + 3] = 0;
            }
        }
    }
}

fn read_exact(rd: &mut &[u8], buf: &mut [u8]) -> Result<(), AhxError> {
    rd.read_exact(buf).map_err(|_| AhxError::NotAnAhx)
}

fn read_byte(rd: &mut &[u8]) -> Result<u8, AhxError> {
    let mut byte = [0u8; 1];
    read_exact(rd, &mut byte)?;
    Ok(byte[0])
}

fn read_word(rd: &mut &[u8]) -> Result<u16, AhxError> {
    let mut word = [0u8; 2];
    read_exact(rd, &mut word)?;
    Ok(u16::from_be_bytes(word))
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Byte-level module builders shared by the crate's tests.

    /// Encodes one track row.
    pub(crate) fn row(note: u8, instr: u8, cmd: u8, param: u8) -> [u8; 3] {
        [(note << 2) | (instr >> 4), ((instr & 0x0F) << 4) | (cmd & 0x0F), param]
    }

    /// Encodes one performance-list entry.
    pub(crate) fn perf_entry(cmd1: u8, cmd2: u8, wave: u8, fixed: bool, note: u8, p1: u8, p2: u8) -> [u8; 4] {
        [
            ((cmd2 & 7) << 5) | ((cmd1 & 7) << 2) | (wave >> 1),
            ((wave & 1) << 7) | ((fixed as u8) << 6) | (note & 0x3F),
            p1,
            p2,
        ]
    }

    /// Encodes an instrument record: 22-byte header plus the perf list.
    pub(crate) struct TestInstrument {
        pub volume: u8,
        pub filter_speed_wavelength: u8,
        pub adsr: [u8; 7],
        pub vibrato: [u8; 3],
        pub square: [u8; 3],
        pub filter: [u8; 2],
        pub perf_speed: u8,
        pub perf_list: Vec<[u8; 4]>,
    }

    impl Default for TestInstrument {
        fn default() -> Self {
            TestInstrument {
                volume: 64,
                filter_speed_wavelength: 4 << 3,
                // aFrames/aVolume/dFrames/dVolume/sFrames/rFrames/rVolume
                adsr: [1, 64, 1, 64, 100, 1, 0],
                vibrato: [0, 0, 0],
                square: [0x20, 0x3F, 1],
                filter: [1, 0x1F],
                perf_speed: 1,
                perf_list: vec![perf_entry(0, 0, 1, false, 1, 0, 0)],
            }
        }
    }

    impl TestInstrument {
        pub(crate) fn bytes(&self) -> Vec<u8> {
            let mut data = vec![
                self.volume,
                self.filter_speed_wavelength,
                self.adsr[0],
                self.adsr[1],
                self.adsr[2],
                self.adsr[3],
                self.adsr[4],
                self.adsr[5],
                self.adsr[6],
                0,
                0,
                0,
                self.filter[0],
                self.vibrato[0],
                self.vibrato[1],
                self.vibrato[2],
                self.square[0],
                self.square[1],
                self.square[2],
                self.filter[1],
                self.perf_speed,
                self.perf_list.len() as u8,
            ];
            for entry in self.perf_list.iter() {
                data.extend_from_slice(entry);
            }
            data
        }
    }

    /// A buildable module image.
    pub(crate) struct TestModule {
        pub revision: u8,
        pub track_zero_empty: bool,
        pub cia_select: u16,
        pub restart: u16,
        pub track_length: u8,
        pub highest_track: u8,
        pub subsongs: Vec<u16>,
        /// Four (track, transpose) pairs per position.
        pub positions: Vec<[u8; 8]>,
        /// Row data of each stored track (track 0 omitted if implicit).
        pub tracks: Vec<Vec<[u8; 3]>>,
        pub instruments: Vec<TestInstrument>,
        pub name: &'static str,
    }

    impl Default for TestModule {
        fn default() -> Self {
            TestModule {
                revision: 1,
                track_zero_empty: false,
                cia_select: 0,
                restart: 0,
                track_length: 4,
                highest_track: 0,
                subsongs: vec![],
                positions: vec![[0; 8]],
                tracks: vec![vec![[0; 3]; 4]],
                instruments: vec![TestInstrument::default()],
                name: "test song",
            }
        }
    }

    impl TestModule {
        pub(crate) fn bytes(&self) -> Vec<u8> {
            let mut data = vec![b'T', b'H', b'X', self.revision, 0, 0];
            let flags = ((self.track_zero_empty as u16) << 15)
                | (self.cia_select << 13)
                | (self.positions.len() as u16 & 0x3FF);
            data.extend_from_slice(&flags.to_be_bytes());
            data.extend_from_slice(&self.restart.to_be_bytes());
            data.push(self.track_length);
            data.push(self.highest_track);
            data.push(self.instruments.len() as u8);
            data.push(self.subsongs.len() as u8);
            for subsong in self.subsongs.iter() {
                data.extend_from_slice(&subsong.to_be_bytes());
            }
            for position in self.positions.iter() {
                data.extend_from_slice(position);
            }
            for track in self.tracks.iter() {
                assert_eq!(track.len(), self.track_length as usize);
                for row in track.iter() {
                    data.extend_from_slice(row);
                }
            }
            for instrument in self.instruments.iter() {
                data.extend_from_slice(&instrument.bytes());
            }
            data.extend_from_slice(self.name.as_bytes());
            data.push(0);
            data
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn rejects_foreign_data() {
        assert!(matches!(AhxModule::parse(b"MOD!"), Err(AhxError::NotAnAhx)));
        assert!(matches!(AhxModule::parse(b"TH"), Err(AhxError::NotAnAhx)));
        // revision 2 does not exist
        let mut data = TestModule::default().bytes();
        data[3] = 2;
        assert!(matches!(AhxModule::parse(&data), Err(AhxError::NotAnAhx)));
        // truncated in the middle of the track table
        let data = TestModule::default().bytes();
        assert!(matches!(AhxModule::parse(&data[..20]), Err(AhxError::NotAnAhx)));
    }

    #[test]
    fn parses_header_fields() {
        let spec = TestModule {
            cia_select: 3,
            subsongs: vec![1, 2],
            positions: vec![[0; 8]; 3],
            restart: 2,
            name: "header test",
            ..TestModule::default()
        };
        let module = AhxModule::parse(&spec.bytes()).unwrap();
        assert_eq!(module.revision, 1);
        assert_eq!(module.song_length, 3);
        assert_eq!(module.restart_pos, 2);
        assert_eq!(module.cia_period, 3552);
        assert_eq!(module.subsongs.as_ref(), &[1, 2]);
        assert_eq!(module.name, "header test");
        assert_eq!(module.instruments.len(), 1);
    }

    #[test]
    fn empty_track_zero_reads_one_track_into_second_slot() {
        let rows = vec![row(12, 1, 0, 0), row(0, 0, 0xF, 3), [0; 3], [0; 3]];
        let spec = TestModule {
            track_zero_empty: true,
            highest_track: 1,
            tracks: vec![rows],
            ..TestModule::default()
        };
        let module = AhxModule::parse(&spec.bytes()).unwrap();
        // track 0 stays silent
        for row_nr in 0..64 {
            assert_eq!(module.track_row(0, row_nr), [0; 3]);
        }
        // the stored track landed in slot 1
        assert_eq!(module.track_row(1, 0), row(12, 1, 0, 0));
        assert_eq!(module.track_row(1, 1), row(0, 0, 0xF, 3));
    }

    #[test]
    fn restart_position_is_coerced_into_range() {
        let spec = TestModule {
            restart: 7,
            positions: vec![[0; 8]; 2],
            ..TestModule::default()
        };
        let module = AhxModule::parse(&spec.bytes()).unwrap();
        assert_eq!(module.restart_pos, 0);
    }

    #[test]
    fn perf_list_reads_zero_past_its_length() {
        let module = AhxModule::parse(&TestModule::default().bytes()).unwrap();
        let instrument = &module.instruments[0];
        assert_eq!(instrument.perf_length, 1);
        assert_eq!(instrument.perf_list.len(), PERF_LIST_BYTES);
        assert!(instrument.perf_list[4..].iter().all(|&b| b == 0));
        assert_eq!(instrument.perf_byte(-1), 0);
        assert_eq!(instrument.perf_byte(PERF_LIST_BYTES as i32), 0);
    }

    #[test]
    fn revision_zero_filter_commands_are_stripped() {
        let rows = vec![row(0, 0, 4, 0x42), row(0, 0, 3, 0x42), [0; 3], [0; 3]];
        let mut instrument = TestInstrument::default();
        instrument.perf_list = vec![
            perf_entry(0, 4, 1, false, 1, 0x11, 0x22),
            perf_entry(1, 2, 0, false, 0, 0x33, 0x44),
        ];
        let spec = TestModule {
            revision: 0,
            tracks: vec![rows],
            instruments: vec![instrument],
            ..TestModule::default()
        };
        let module = AhxModule::parse(&spec.bytes()).unwrap();
        // 4xy stripped, 3xy untouched
        assert_eq!(module.track_row(0, 0), [0, 0, 0]);
        assert_eq!(module.track_row(0, 1), row(0, 0, 3, 0x42));
        // perf commands 0 and 4 lose their parameters, 1 and 2 keep them
        let perf = &module.instruments[0].perf_list;
        assert_eq!(&perf[0..4], &perf_entry(0, 4, 1, false, 1, 0, 0));
        assert_eq!(&perf[4..8], &perf_entry(1, 2, 0, false, 0, 0x33, 0x44));
    }

    #[test]
    fn missing_instrument_resolves_to_the_empty_sentinel() {
        let module = AhxModule::parse(&TestModule::default().bytes()).unwrap();
        let empty = module.instrument(60);
        assert_eq!(empty.a_frames, 1);
        assert_eq!(empty.square_lower_limit, 0x20);
        assert_eq!(empty.square_upper_limit, 0x3F);
        assert_eq!(empty.filter_speed_wavelength, 32);
        assert_eq!(empty.perf_speed, 1);
        // instrument 0 means "none" and resolves to the sentinel too
        assert_eq!(module.instrument(0).a_frames, 1);
        // a real instrument resolves normally
        assert_eq!(module.instrument(1).volume, 64);
    }
}
